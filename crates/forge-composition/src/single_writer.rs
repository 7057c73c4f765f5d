//! Single writer composition strategy
//!
//! Each component owns a disjoint set of paths. A change set may be merged
//! only if every path it touches is claimed by its owner and is not already
//! held by another merged component. Validation happens before anything is
//! staged, so a conflict is always raised before commit.

use crate::claims::OwnershipClaims;
use crate::conflict::{CompositionError, ConflictKind, PathConflict};
use forge_artifact::{ChangeSet, Snapshot, WorkspacePath};
use std::collections::BTreeMap;

/// Pluggable merge validation
pub trait CompositionStrategy: Send + Sync + std::fmt::Debug {
    /// Check `sets` against the merged `base` and registered `claims`
    ///
    /// # Errors
    /// [`CompositionError::Conflict`] listing every offending path
    fn validate(
        &self,
        base: &Snapshot,
        claims: &OwnershipClaims,
        sets: &[&ChangeSet],
    ) -> Result<Validation, CompositionError>;

    /// Strategy name (for logs)
    fn name(&self) -> &'static str;
}

/// Summary of a successful validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validation {
    /// Paths touched, with their writer
    pub writers: BTreeMap<WorkspacePath, String>,
}

impl Validation {
    /// Number of touched paths
    #[inline]
    #[must_use]
    pub fn path_count(&self) -> usize {
        self.writers.len()
    }
}

/// Single writer strategy: disjoint path claims
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleWriterStrategy;

impl SingleWriterStrategy {
    /// Create new single writer strategy
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl CompositionStrategy for SingleWriterStrategy {
    fn validate(
        &self,
        base: &Snapshot,
        claims: &OwnershipClaims,
        sets: &[&ChangeSet],
    ) -> Result<Validation, CompositionError> {
        let mut writers: BTreeMap<WorkspacePath, String> = BTreeMap::new();
        let mut conflicts = Vec::new();

        for set in sets {
            let owner = set.owner();
            for path in set.paths() {
                if let Some(previous) = writers.get(path) {
                    conflicts.push(PathConflict {
                        path: path.clone(),
                        kind: ConflictKind::OverlappingClaims,
                        writer: owner.to_string(),
                        holder: Some(previous.clone()),
                    });
                    continue;
                }

                if let Some(holder) = base.owner_of(path).filter(|h| *h != owner) {
                    conflicts.push(PathConflict {
                        path: path.clone(),
                        kind: ConflictKind::MergedByOther,
                        writer: owner.to_string(),
                        holder: Some(holder.to_string()),
                    });
                    continue;
                }

                if let Err(CompositionError::Conflict { conflicts: scoped }) =
                    claims.authorize(owner, path)
                {
                    conflicts.extend(scoped);
                    continue;
                }

                writers.insert(path.clone(), owner.to_string());
            }
        }

        if conflicts.is_empty() {
            Ok(Validation { writers })
        } else {
            Err(CompositionError::Conflict { conflicts })
        }
    }

    fn name(&self) -> &'static str {
        "SingleWriter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_artifact::SnapshotArena;
    use std::sync::Arc;

    fn p(s: &str) -> WorkspacePath {
        WorkspacePath::new(s).unwrap()
    }

    fn claims() -> OwnershipClaims {
        let mut claims = OwnershipClaims::new();
        claims.claim("ui", [&p("ui/App.tsx"), &p("ui/Nav.tsx")]).unwrap();
        claims.claim("api", [&p("api/server.ts")]).unwrap();
        claims
    }

    #[test]
    fn disjoint_sets_validate() {
        let arena = SnapshotArena::new();
        let mut ui = ChangeSet::new("ui");
        ui.write(p("ui/App.tsx"), b"app".to_vec());
        let mut api = ChangeSet::new("api");
        api.write(p("api/server.ts"), b"srv".to_vec());

        let validation = SingleWriterStrategy::new()
            .validate(&arena.head(), &claims(), &[&ui, &api])
            .unwrap();
        assert_eq!(validation.path_count(), 2);
    }

    #[test]
    fn out_of_scope_write_is_rejected() {
        let arena = SnapshotArena::new();
        let mut ui = ChangeSet::new("ui");
        ui.write(p("api/server.ts"), b"hijack".to_vec());

        let err = SingleWriterStrategy::new()
            .validate(&arena.head(), &claims(), &[&ui])
            .unwrap_err();
        let CompositionError::Conflict { conflicts } = err else {
            panic!("expected conflict");
        };
        assert_eq!(conflicts[0].kind, ConflictKind::OutOfScope);
        assert_eq!(conflicts[0].holder.as_deref(), Some("api"));
    }

    #[test]
    fn path_merged_by_other_component_conflicts() {
        let mut arena = SnapshotArena::new();
        let mut staging = arena.stage();
        staging.put(p("shared.ts"), Arc::from(&b"x"[..]), "api");
        arena.commit(staging, "api").unwrap();

        let mut claims = OwnershipClaims::new();
        claims.claim("ui", [&p("shared.ts")]).unwrap();
        let mut ui = ChangeSet::new("ui");
        ui.write(p("shared.ts"), b"y".to_vec());

        let err = SingleWriterStrategy::new()
            .validate(&arena.head(), &claims, &[&ui])
            .unwrap_err();
        assert_eq!(err.paths(), vec![p("shared.ts")]);
    }

    #[test]
    fn two_sets_touching_one_path_conflict() {
        let arena = SnapshotArena::new();
        let mut a = ChangeSet::new("ui");
        a.write(p("ui/App.tsx"), b"a".to_vec());
        let mut b = ChangeSet::new("api");
        b.write(p("ui/App.tsx"), b"b".to_vec());

        let err = SingleWriterStrategy::new()
            .validate(&arena.head(), &claims(), &[&a, &b])
            .unwrap_err();
        assert_eq!(err.paths(), vec![p("ui/App.tsx")]);
    }
}
