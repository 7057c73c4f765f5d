//! Ownership claims
//!
//! Every path in the workspace belongs to at most one component. Claims are
//! registered when the partition is accepted and checked on every write.

use crate::conflict::{CompositionError, ConflictKind, PathConflict};
use forge_artifact::WorkspacePath;
use std::collections::{BTreeMap, BTreeSet};

/// Registry of `path → owner`
#[derive(Debug, Clone, Default)]
pub struct OwnershipClaims {
    by_path: BTreeMap<WorkspacePath, String>,
    by_owner: BTreeMap<String, BTreeSet<WorkspacePath>>,
}

impl OwnershipClaims {
    /// Empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `paths` for `owner`
    ///
    /// All-or-nothing: if any path is held by a different owner, no claim is
    /// recorded and every overlap is reported.
    ///
    /// # Errors
    /// [`CompositionError::Conflict`] with kind [`ConflictKind::OverlappingClaims`]
    pub fn claim<'a>(
        &mut self,
        owner: &str,
        paths: impl IntoIterator<Item = &'a WorkspacePath>,
    ) -> Result<(), CompositionError> {
        let paths: Vec<&WorkspacePath> = paths.into_iter().collect();
        let conflicts: Vec<PathConflict> = paths
            .iter()
            .filter_map(|path| {
                self.by_path
                    .get(*path)
                    .filter(|holder| holder.as_str() != owner)
                    .map(|holder| PathConflict {
                        path: (*path).clone(),
                        kind: ConflictKind::OverlappingClaims,
                        writer: owner.to_string(),
                        holder: Some(holder.clone()),
                    })
            })
            .collect();
        if !conflicts.is_empty() {
            return Err(CompositionError::Conflict { conflicts });
        }

        let owned = self.by_owner.entry(owner.to_string()).or_default();
        for path in paths {
            self.by_path.insert(path.clone(), owner.to_string());
            owned.insert(path.clone());
        }
        Ok(())
    }

    /// Drop every claim held by `owner`
    pub fn release(&mut self, owner: &str) -> BTreeSet<WorkspacePath> {
        let released = self.by_owner.remove(owner).unwrap_or_default();
        for path in &released {
            self.by_path.remove(path);
        }
        released
    }

    /// Holder of a path
    #[must_use]
    pub fn owner_of(&self, path: &WorkspacePath) -> Option<&str> {
        self.by_path.get(path).map(String::as_str)
    }

    /// Paths claimed by `owner`
    #[must_use]
    pub fn owned_by(&self, owner: &str) -> Option<&BTreeSet<WorkspacePath>> {
        self.by_owner.get(owner)
    }

    /// Check that `owner` may write `path`
    ///
    /// # Errors
    /// [`ConflictKind::OutOfScope`] if the path is unclaimed or held by another owner
    pub fn authorize(&self, owner: &str, path: &WorkspacePath) -> Result<(), CompositionError> {
        match self.by_path.get(path) {
            Some(holder) if holder == owner => Ok(()),
            holder => Err(CompositionError::conflict(PathConflict {
                path: path.clone(),
                kind: ConflictKind::OutOfScope,
                writer: owner.to_string(),
                holder: holder.cloned(),
            })),
        }
    }

    /// Number of claimed paths
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    /// No claims
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

/// Overlap between two owned sets
#[must_use]
pub fn overlap<'a>(
    a: &'a BTreeSet<WorkspacePath>,
    b: &'a BTreeSet<WorkspacePath>,
) -> Vec<&'a WorkspacePath> {
    a.intersection(b).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn p(s: &str) -> WorkspacePath {
        WorkspacePath::new(s).unwrap()
    }

    #[test]
    fn overlapping_claim_is_rejected_atomically() {
        let mut claims = OwnershipClaims::new();
        claims.claim("ui", [&p("a.ts"), &p("b.ts")]).unwrap();

        let err = claims.claim("api", [&p("c.ts"), &p("b.ts")]).unwrap_err();
        assert_eq!(err.paths(), vec![p("b.ts")]);
        assert_eq!(claims.owner_of(&p("c.ts")), None);
    }

    #[test]
    fn reclaiming_own_path_is_fine() {
        let mut claims = OwnershipClaims::new();
        claims.claim("ui", [&p("a.ts")]).unwrap();
        claims.claim("ui", [&p("a.ts"), &p("b.ts")]).unwrap();
        assert_eq!(claims.owned_by("ui").map(BTreeSet::len), Some(2));
    }

    #[test]
    fn authorize_rejects_foreign_and_unclaimed() {
        let mut claims = OwnershipClaims::new();
        claims.claim("ui", [&p("a.ts")]).unwrap();
        assert!(claims.authorize("ui", &p("a.ts")).is_ok());
        assert!(claims.authorize("api", &p("a.ts")).is_err());
        assert!(claims.authorize("ui", &p("z.ts")).is_err());
    }

    #[test]
    fn release_frees_paths() {
        let mut claims = OwnershipClaims::new();
        claims.claim("ui", [&p("a.ts")]).unwrap();
        let freed = claims.release("ui");
        assert_eq!(freed.len(), 1);
        assert!(claims.is_empty());
        claims.claim("api", [&p("a.ts")]).unwrap();
    }

    proptest! {
        #[test]
        fn accepted_claims_stay_disjoint(
            requests in proptest::collection::vec(
                ("[a-c]", proptest::collection::btree_set("[a-h]", 1..4)),
                1..10,
            )
        ) {
            let mut claims = OwnershipClaims::new();
            for (owner, names) in &requests {
                let paths: Vec<WorkspacePath> = names.iter().map(|n| p(&format!("{n}.ts"))).collect();
                let _ = claims.claim(owner, paths.iter());
            }

            let owners: Vec<&str> = ["a", "b", "c"].into_iter().collect();
            for (i, x) in owners.iter().enumerate() {
                for y in owners.iter().skip(i + 1) {
                    if let (Some(sx), Some(sy)) = (claims.owned_by(x), claims.owned_by(y)) {
                        prop_assert!(overlap(sx, sy).is_empty());
                    }
                }
            }
        }
    }
}
