//! Per-path write ledger for one component workspace
//!
//! Agents inside a component may run concurrently, but each path accepts
//! exactly one author. The ledger records the first writer and content hash
//! per path; the [`DashMap`] entry lock serializes concurrent writers to the
//! same path.

use crate::conflict::{CompositionError, ConflictKind, PathConflict};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use forge_artifact::{ContentHash, WorkspacePath};

/// Record of the accepted write to a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Agent that authored the path
    pub agent: String,
    /// Hash of the accepted content
    pub hash: ContentHash,
}

/// What happened to a recorded write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// First write to the path
    Created,
    /// Same agent replaced its own content
    Replaced,
    /// Identical content already present
    Unchanged,
}

/// Path → author ledger
#[derive(Debug, Default)]
pub struct PathWriteLedger {
    owner: String,
    writes: DashMap<WorkspacePath, WriteRecord>,
}

impl PathWriteLedger {
    /// Ledger for the component `owner`
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            writes: DashMap::new(),
        }
    }

    /// Record a write by `agent`
    ///
    /// # Errors
    /// [`ConflictKind::ConcurrentWrite`] when a different agent already wrote
    /// different content to the path. Never last-writer-wins.
    pub fn record(
        &self,
        path: &WorkspacePath,
        hash: ContentHash,
        agent: &str,
    ) -> Result<WriteOutcome, CompositionError> {
        match self.writes.entry(path.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(WriteRecord {
                    agent: agent.to_string(),
                    hash,
                });
                Ok(WriteOutcome::Created)
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.hash == hash {
                    Ok(WriteOutcome::Unchanged)
                } else if existing.agent == agent {
                    slot.get_mut().hash = hash;
                    Ok(WriteOutcome::Replaced)
                } else {
                    Err(CompositionError::conflict(PathConflict {
                        path: path.clone(),
                        kind: ConflictKind::ConcurrentWrite,
                        writer: format!("{}/{agent}", self.owner),
                        holder: Some(format!("{}/{}", self.owner, existing.agent)),
                    }))
                }
            }
        }
    }

    /// Accepted write for a path
    #[must_use]
    pub fn get(&self, path: &WorkspacePath) -> Option<WriteRecord> {
        self.writes.get(path).map(|r| r.value().clone())
    }

    /// Forget everything, e.g. before a rebuild
    pub fn clear(&self) {
        self.writes.clear();
    }

    /// Number of recorded paths
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Nothing recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn p(s: &str) -> WorkspacePath {
        WorkspacePath::new(s).unwrap()
    }

    #[test]
    fn two_agents_different_content_conflict() {
        let ledger = PathWriteLedger::new("ui");
        let path = p("src/App.tsx");
        ledger.record(&path, ContentHash::compute(b"one"), "agent-1").unwrap();

        let err = ledger
            .record(&path, ContentHash::compute(b"two"), "agent-2")
            .unwrap_err();
        assert_eq!(err.paths(), vec![path.clone()]);
        assert_eq!(ledger.get(&path).unwrap().agent, "agent-1");
    }

    #[test]
    fn identical_content_is_not_a_conflict() {
        let ledger = PathWriteLedger::new("ui");
        let path = p("a.ts");
        let hash = ContentHash::compute(b"same");
        ledger.record(&path, hash, "agent-1").unwrap();
        assert_eq!(ledger.record(&path, hash, "agent-2").unwrap(), WriteOutcome::Unchanged);
    }

    #[test]
    fn same_agent_may_replace_its_own_file() {
        let ledger = PathWriteLedger::new("ui");
        let path = p("a.ts");
        ledger.record(&path, ContentHash::compute(b"v1"), "agent-1").unwrap();
        assert_eq!(
            ledger.record(&path, ContentHash::compute(b"v2"), "agent-1").unwrap(),
            WriteOutcome::Replaced
        );
    }

    #[test]
    fn racing_writers_yield_exactly_one_author() {
        let ledger = Arc::new(PathWriteLedger::new("ui"));
        let path = p("race.ts");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let path = path.clone();
                std::thread::spawn(move || {
                    ledger
                        .record(&path, ContentHash::compute(&[i]), &format!("agent-{i}"))
                        .is_ok()
                })
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
    }
}
