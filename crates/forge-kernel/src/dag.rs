use crate::error::GraphError;
use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graphmap::{DiGraphMap, NodeTrait};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt::Debug;

/// Dependency graph. An edge `a -> b` means `b` depends on `a`.
#[derive(Debug, Clone)]
pub struct Dag<N: NodeTrait> {
    inner: DiGraphMap<N, ()>,
}

impl<N: NodeTrait + Debug> Default for Dag<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: NodeTrait + Debug> Dag<N> {
    pub fn new() -> Self {
        Self {
            inner: DiGraphMap::new(),
        }
    }

    pub fn add_node(&mut self, node: N) {
        self.inner.add_node(node);
    }

    /// Record that `node` depends on `on`. Cycles are accepted here and
    /// reported by [`Dag::validate`].
    pub fn add_dependency(&mut self, node: N, on: N) -> Result<(), GraphError> {
        if node == on {
            return Err(GraphError::SelfLoop(format!("{node:?}")));
        }
        self.inner.add_edge(on, node, ());
        Ok(())
    }

    pub fn contains(&self, node: N) -> bool {
        self.inner.contains_node(node)
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = N> + '_ {
        self.inner.nodes()
    }

    pub fn dependencies(&self, node: N) -> Vec<N> {
        self.inner.neighbors_directed(node, Direction::Incoming).collect()
    }

    pub fn dependents(&self, node: N) -> Vec<N> {
        self.inner.neighbors_directed(node, Direction::Outgoing).collect()
    }

    /// Everything that (transitively) depends on `node`.
    pub fn transitive_dependents(&self, node: N) -> BTreeSet<N> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            for next in self.inner.neighbors_directed(current, Direction::Outgoing) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen
    }

    /// Shortest description of one cycle, if any.
    pub fn find_cycle(&self) -> Option<Vec<N>> {
        kosaraju_scc(&self.inner)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .min_by_key(Vec::len)
            .map(|mut scc| {
                scc.sort();
                scc
            })
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        match self.find_cycle() {
            Some(cycle) => Err(GraphError::CycleDetected {
                path: cycle.iter().map(|n| format!("{n:?}")).collect(),
            }),
            None => Ok(()),
        }
    }

    pub fn topological_sort(&self) -> Result<Vec<N>, GraphError> {
        toposort(&self.inner, None).map_err(|_| self.cycle_error())
    }

    /// Nodes grouped by depth: level 0 has no dependencies, level k depends
    /// only on levels below k.
    pub fn levels(&self) -> Result<Vec<Vec<N>>, GraphError> {
        let order = self.topological_sort()?;
        let mut depth: BTreeMap<N, usize> = BTreeMap::new();
        for node in &order {
            let d = self
                .dependencies(*node)
                .iter()
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(*node, d);
        }
        let mut levels: Vec<Vec<N>> = Vec::new();
        for (node, d) in depth {
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(node);
        }
        Ok(levels)
    }

    /// Topological order where, among ready nodes, fewer transitive
    /// dependents merge first, then fewer declared dependencies, then node order.
    pub fn merge_order(&self) -> Result<Vec<N>, GraphError> {
        self.validate()?;
        let mut remaining: BTreeMap<N, usize> = self
            .inner
            .nodes()
            .map(|n| (n, self.dependencies(n).len()))
            .collect();
        let key = |n: N| Reverse((self.transitive_dependents(n).len(), self.dependencies(n).len(), n));

        let mut ready: BinaryHeap<Reverse<(usize, usize, N)>> = remaining
            .iter()
            .filter(|(_, deps)| **deps == 0)
            .map(|(n, _)| key(*n))
            .collect();
        let mut order = Vec::with_capacity(remaining.len());

        while let Some(Reverse((_, _, node))) = ready.pop() {
            order.push(node);
            for next in self.dependents(node) {
                if let Some(count) = remaining.get_mut(&next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(key(next));
                    }
                }
            }
        }
        Ok(order)
    }

    fn cycle_error(&self) -> GraphError {
        GraphError::CycleDetected {
            path: self
                .find_cycle()
                .unwrap_or_default()
                .iter()
                .map(|n| format!("{n:?}"))
                .collect(),
        }
    }
}
