//! Component partitioning
//!
//! Turns a locked contract's architecture plan into a dependency DAG of
//! components with disjoint file ownership, depth levels for concurrent
//! builds and a merge order.

use crate::component::{Component, InterfaceContract};
use crate::contract::IntentContract;
use crate::error::{ForgeResult, PartitionError};
use crate::ports::ArchitecturePlanner;
use crate::types::{ComponentId, CriterionId, SessionId};
use async_trait::async_trait;
use forge_artifact::WorkspacePath;
use forge_kernel::{ComponentStatus, Dag, GraphError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One component as proposed by the planner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Unique name
    pub name: String,
    /// Names of components that must merge first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Files this component writes
    #[serde(default)]
    pub owned_files: BTreeSet<WorkspacePath>,
    /// Files it would share with cycle partners; promoted on a cycle
    #[serde(default)]
    pub shared_files: BTreeSet<WorkspacePath>,
    /// Interface promised to dependents
    #[serde(default)]
    pub interface: InterfaceContract,
    /// Criteria it is responsible for
    #[serde(default)]
    pub criteria: Vec<CriterionId>,
    /// Feature grouping
    #[serde(default)]
    pub feature: Option<String>,
}

impl ComponentSpec {
    /// Spec owning `files`
    #[must_use]
    pub fn new<'a>(name: impl Into<String>, files: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            name: name.into(),
            owned_files: files.into_iter().filter_map(|f| WorkspacePath::new(f).ok()).collect(),
            ..Self::default()
        }
    }

    /// With dependencies
    #[must_use]
    pub fn depends_on<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.depends_on.extend(names.into_iter().map(str::to_string));
        self
    }

    /// With criteria
    #[must_use]
    pub fn with_criteria<'a>(mut self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        self.criteria.extend(ids.into_iter().map(CriterionId::from));
        self
    }

    /// With feature
    #[must_use]
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    /// With files shared with cycle partners
    #[must_use]
    pub fn with_shared<'a>(mut self, files: impl IntoIterator<Item = &'a str>) -> Self {
        self.shared_files
            .extend(files.into_iter().filter_map(|f| WorkspacePath::new(f).ok()));
        self
    }
}

/// Planner output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitecturePlan {
    /// Proposed components
    pub components: Vec<ComponentSpec>,
}

impl ArchitecturePlan {
    /// Plan from specs
    #[must_use]
    pub fn new(components: Vec<ComponentSpec>) -> Self {
        Self { components }
    }
}

/// Validated partition
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    /// Components, all `Pending`
    pub components: Vec<Component>,
    /// Dependency graph
    pub dag: Dag<ComponentId>,
    /// Components grouped by depth
    pub levels: Vec<Vec<ComponentId>>,
    /// Global merge order
    pub merge_order: Vec<ComponentId>,
}

impl PartitionPlan {
    /// Position of a component in the merge order
    #[must_use]
    pub fn merge_rank(&self, id: ComponentId) -> usize {
        self.merge_order.iter().position(|c| *c == id).unwrap_or(usize::MAX)
    }
}

/// Builds a [`PartitionPlan`]
#[derive(Debug, Clone, Copy, Default)]
pub struct Partitioner;

impl Partitioner {
    /// Validate `plan` and lay it out as a DAG
    ///
    /// Criteria whose verification target is owned by a component are added
    /// to that component's responsibilities.
    ///
    /// # Errors
    /// [`PartitionError`] for empty plans, duplicate names, unknown
    /// dependencies, overlapping ownership and dependency cycles
    pub fn partition(
        &self,
        session_id: SessionId,
        contract: &IntentContract,
        plan: &ArchitecturePlan,
    ) -> Result<PartitionPlan, PartitionError> {
        if plan.components.is_empty() {
            return Err(PartitionError::Empty);
        }

        let mut ids: HashMap<&str, ComponentId> = HashMap::new();
        for spec in &plan.components {
            if ids.insert(spec.name.as_str(), ComponentId::new()).is_some() {
                return Err(PartitionError::DuplicateName(spec.name.clone()));
            }
        }

        let mut owners: BTreeMap<&WorkspacePath, &str> = BTreeMap::new();
        for spec in &plan.components {
            for path in &spec.owned_files {
                if let Some(first) = owners.insert(path, spec.name.as_str()) {
                    return Err(PartitionError::OverlappingOwnership {
                        path: path.to_string(),
                        first: first.to_string(),
                        second: spec.name.clone(),
                    });
                }
            }
        }

        let mut dag = Dag::new();
        let mut components = Vec::with_capacity(plan.components.len());
        for spec in &plan.components {
            let id = ids[spec.name.as_str()];
            dag.add_node(id);
            let mut depends_on = Vec::with_capacity(spec.depends_on.len());
            for dep in &spec.depends_on {
                let dep_id = *ids.get(dep.as_str()).ok_or_else(|| PartitionError::UnknownDependency {
                    component: spec.name.clone(),
                    dependency: dep.clone(),
                })?;
                dag.add_dependency(id, dep_id).map_err(|err| match err {
                    GraphError::SelfLoop(_) => PartitionError::Cycle {
                        members: vec![spec.name.clone()],
                    },
                    other => other.into(),
                })?;
                if !depends_on.contains(&dep_id) {
                    depends_on.push(dep_id);
                }
            }

            let mut criteria = spec.criteria.clone();
            for criterion in contract.criteria() {
                let owned = criterion
                    .method
                    .target_path()
                    .is_some_and(|p| spec.owned_files.contains(p));
                if owned && !criteria.contains(&criterion.id) {
                    criteria.push(criterion.id.clone());
                }
            }

            components.push(Component {
                id,
                session_id,
                name: spec.name.clone(),
                depends_on,
                status: ComponentStatus::Pending,
                owned_files: spec.owned_files.clone(),
                interface: spec.interface.clone(),
                criteria,
                feature: spec.feature.clone(),
                flagged_paths: BTreeSet::new(),
                build_count: 0,
                merged_revision: None,
            });
        }

        if let Some(cycle) = dag.find_cycle() {
            let names: BTreeMap<ComponentId, &str> = ids.iter().map(|(n, id)| (*id, *n)).collect();
            let mut members: Vec<String> = cycle
                .iter()
                .filter_map(|id| names.get(id).map(|n| (*n).to_string()))
                .collect();
            members.sort();
            return Err(PartitionError::Cycle { members });
        }

        let levels = dag.levels()?;
        let merge_order = dag.merge_order()?;
        tracing::info!(
            components = components.len(),
            depth = levels.len(),
            "partitioned architecture plan"
        );
        Ok(PartitionPlan {
            components,
            dag,
            levels,
            merge_order,
        })
    }
}

/// Break a cycle by moving the members' shared files into a new component
///
/// The new component owns the union of the members' `shared_files`, depends
/// on whatever the members depended on outside the cycle, and every member
/// now depends on it instead of on each other. Returns `None` when the
/// members declare nothing shared.
#[must_use]
pub fn promote_shared(plan: &ArchitecturePlan, cycle: &[String]) -> Option<ArchitecturePlan> {
    let members: BTreeSet<&str> = cycle.iter().map(String::as_str).collect();
    let shared: BTreeSet<WorkspacePath> = plan
        .components
        .iter()
        .filter(|c| members.contains(c.name.as_str()))
        .flat_map(|c| c.shared_files.iter().cloned())
        .collect();
    if shared.is_empty() {
        return None;
    }

    let name = format!("shared-{}", members.iter().copied().collect::<Vec<_>>().join("-"));
    let mut outside_deps: Vec<String> = Vec::new();
    let mut components: Vec<ComponentSpec> = plan
        .components
        .iter()
        .map(|spec| {
            if !members.contains(spec.name.as_str()) {
                return spec.clone();
            }
            let mut spec = spec.clone();
            spec.depends_on.retain(|d| !members.contains(d.as_str()));
            for dep in &spec.depends_on {
                if !outside_deps.contains(dep) {
                    outside_deps.push(dep.clone());
                }
            }
            spec.depends_on.push(name.clone());
            spec.owned_files.retain(|p| !shared.contains(p));
            spec.shared_files.clear();
            spec
        })
        .collect();

    tracing::info!(component = %name, files = shared.len(), "promoted shared files out of a cycle");
    components.push(ComponentSpec {
        name,
        depends_on: outside_deps,
        owned_files: shared,
        ..ComponentSpec::default()
    });
    Some(ArchitecturePlan { components })
}

/// Planner returning a fixed plan
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    plan: ArchitecturePlan,
}

impl StaticPlanner {
    /// Planner always returning `plan`
    #[must_use]
    pub fn new(plan: ArchitecturePlan) -> Self {
        Self { plan }
    }
}

#[async_trait]
impl ArchitecturePlanner for StaticPlanner {
    async fn plan(&self, _contract: &IntentContract) -> ForgeResult<ArchitecturePlan> {
        Ok(self.plan.clone())
    }
}

/// Planner grouping criterion targets by parent directory
///
/// `src/api/users.ts` lands in component `api`; files at the root land in
/// `app`. Criteria without a target path are left to the gate's fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryPlanner;

#[async_trait]
impl ArchitecturePlanner for DirectoryPlanner {
    async fn plan(&self, contract: &IntentContract) -> ForgeResult<ArchitecturePlan> {
        let mut groups: BTreeMap<String, ComponentSpec> = BTreeMap::new();
        for criterion in contract.criteria() {
            let Some(path) = criterion.method.target_path() else { continue };
            let name = path
                .parent()
                .and_then(|dir| dir.rsplit('/').next())
                .filter(|dir| !dir.is_empty())
                .unwrap_or("app")
                .to_string();
            let spec = groups.entry(name.clone()).or_insert_with(|| ComponentSpec {
                name,
                feature: Some("app".to_string()),
                ..ComponentSpec::default()
            });
            spec.owned_files.insert(path.clone());
        }
        if groups.is_empty() {
            groups.insert(
                "app".to_string(),
                ComponentSpec::new("app", ["README.md"]).with_feature("app"),
            );
        }
        Ok(ArchitecturePlan::new(groups.into_values().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{CriterionDraft, VerificationMethod};
    use pretty_assertions::assert_eq;

    fn contract() -> IntentContract {
        let mut contract = IntentContract::draft("todo app");
        for path in ["src/api/server.ts", "src/ui/app.tsx"] {
            contract
                .add_criterion(CriterionDraft {
                    description: format!("{path} exists"),
                    method: Some(VerificationMethod::FileExists {
                        path: WorkspacePath::new(path).unwrap(),
                    }),
                })
                .unwrap();
        }
        contract.lock().unwrap();
        contract
    }

    fn names(plan: &PartitionPlan, ids: &[ComponentId]) -> Vec<String> {
        ids.iter()
            .map(|id| plan.components.iter().find(|c| c.id == *id).unwrap().name.clone())
            .collect()
    }

    #[test]
    fn diamond_levels_and_merge_order() {
        let plan = ArchitecturePlan::new(vec![
            ComponentSpec::new("types", ["src/types.ts"]),
            ComponentSpec::new("api", ["src/api/server.ts"]).depends_on(["types"]),
            ComponentSpec::new("ui", ["src/ui/app.tsx"]).depends_on(["types"]),
            ComponentSpec::new("e2e", ["tests/e2e.ts"]).depends_on(["api", "ui"]),
        ]);
        let partition = Partitioner.partition(SessionId::new(), &contract(), &plan).unwrap();
        assert_eq!(partition.levels.len(), 3);
        let order = names(&partition, &partition.merge_order);
        assert_eq!(order[0], "types");
        assert_eq!(order[3], "e2e");

        let api = partition.components.iter().find(|c| c.name == "api").unwrap();
        assert_eq!(api.criteria, vec![CriterionId::from("C1")]);
        assert_eq!(api.depends_on.len(), 1);
    }

    #[test]
    fn invalid_plans_are_rejected() {
        let contract = contract();
        let session = SessionId::new();
        let cases = [
            (ArchitecturePlan::default(), PartitionError::Empty),
            (
                ArchitecturePlan::new(vec![ComponentSpec::new("a", ["x.ts"]), ComponentSpec::new("a", ["y.ts"])]),
                PartitionError::DuplicateName("a".into()),
            ),
            (
                ArchitecturePlan::new(vec![ComponentSpec::new("a", ["x.ts"]).depends_on(["ghost"])]),
                PartitionError::UnknownDependency {
                    component: "a".into(),
                    dependency: "ghost".into(),
                },
            ),
            (
                ArchitecturePlan::new(vec![ComponentSpec::new("a", ["x.ts"]), ComponentSpec::new("b", ["x.ts"])]),
                PartitionError::OverlappingOwnership {
                    path: "x.ts".into(),
                    first: "a".into(),
                    second: "b".into(),
                },
            ),
        ];
        for (plan, expected) in cases {
            assert_eq!(Partitioner.partition(session, &contract, &plan).unwrap_err(), expected);
        }
    }

    #[test]
    fn cycle_is_reported_and_promotion_breaks_it() {
        let plan = ArchitecturePlan::new(vec![
            ComponentSpec::new("api", ["src/api/server.ts"])
                .depends_on(["ui"])
                .with_shared(["src/shared/types.ts"]),
            ComponentSpec::new("ui", ["src/ui/app.tsx"])
                .depends_on(["api"])
                .with_shared(["src/shared/types.ts"]),
        ]);
        let err = Partitioner.partition(SessionId::new(), &contract(), &plan).unwrap_err();
        let members = match err {
            PartitionError::Cycle { members } => members,
            other => panic!("expected a cycle, got {other:?}"),
        };
        assert_eq!(members, vec!["api".to_string(), "ui".to_string()]);

        let promoted = promote_shared(&plan, &members).unwrap();
        let partition = Partitioner.partition(SessionId::new(), &contract(), &promoted).unwrap();
        let order = names(&partition, &partition.merge_order);
        assert_eq!(order[0], "shared-api-ui");
        assert_eq!(partition.levels.len(), 2);
    }

    #[test]
    fn promotion_needs_shared_files() {
        let plan = ArchitecturePlan::new(vec![
            ComponentSpec::new("a", ["a.ts"]).depends_on(["b"]),
            ComponentSpec::new("b", ["b.ts"]).depends_on(["a"]),
        ]);
        assert!(promote_shared(&plan, &["a".into(), "b".into()]).is_none());
    }

    #[tokio::test]
    async fn directory_planner_groups_targets() {
        let plan = DirectoryPlanner.plan(&contract()).await.unwrap();
        let names: Vec<_> = plan.components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["api", "ui"]);
        assert!(Partitioner.partition(SessionId::new(), &contract(), &plan).is_ok());
    }
}
