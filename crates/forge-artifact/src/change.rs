//! File changes and change sets
//!
//! A [`ChangeSet`] is everything one component wants to publish into the
//! shared workspace. Each [`FileChange`] records its owning component so
//! conflicts can be attributed without a second lookup.

use crate::hash::ContentHash;
use crate::path::WorkspacePath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a change does to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    /// Path did not exist before
    Create,
    /// Path existed and content changes
    Modify,
    /// Path is removed
    Delete,
}

/// Single file change, attributed to its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Target path
    pub path: WorkspacePath,
    /// Action
    pub action: FileAction,
    /// Hash of the new content (zero for deletes)
    pub content_hash: ContentHash,
    /// Owning component, as an opaque string id
    pub owner: String,
}

/// Ordered set of writes from one owner
///
/// Holds the payloads alongside the change records; one entry per path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    owner: String,
    writes: BTreeMap<WorkspacePath, Option<Arc<[u8]>>>,
}

impl ChangeSet {
    /// Empty change set for `owner`
    #[inline]
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            writes: BTreeMap::new(),
        }
    }

    /// Stage a write; replaces any earlier staged write to the same path
    pub fn write(&mut self, path: WorkspacePath, content: impl Into<Arc<[u8]>>) {
        self.writes.insert(path, Some(content.into()));
    }

    /// Stage a delete
    pub fn delete(&mut self, path: WorkspacePath) {
        self.writes.insert(path, None);
    }

    /// Owning component id
    #[inline]
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Number of staged paths
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// No staged paths
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Staged paths in order
    pub fn paths(&self) -> impl Iterator<Item = &WorkspacePath> {
        self.writes.keys()
    }

    /// Staged entries; `None` payload means delete
    pub fn entries(&self) -> impl Iterator<Item = (&WorkspacePath, Option<&Arc<[u8]>>)> {
        self.writes.iter().map(|(path, data)| (path, data.as_ref()))
    }

    /// Payload staged for `path`
    #[must_use]
    pub fn get(&self, path: &WorkspacePath) -> Option<&Arc<[u8]>> {
        self.writes.get(path).and_then(Option::as_ref)
    }

    /// Describe the staged writes relative to `exists`, which reports whether a
    /// path is already present in the base snapshot
    pub fn describe(&self, exists: impl Fn(&WorkspacePath) -> bool) -> Vec<FileChange> {
        self.writes
            .iter()
            .map(|(path, data)| {
                let (action, content_hash) = match data {
                    Some(bytes) if exists(path) => (FileAction::Modify, ContentHash::compute(bytes)),
                    Some(bytes) => (FileAction::Create, ContentHash::compute(bytes)),
                    None => (FileAction::Delete, ContentHash::default()),
                };
                FileChange {
                    path: path.clone(),
                    action,
                    content_hash,
                    owner: self.owner.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> WorkspacePath {
        WorkspacePath::new(s).unwrap()
    }

    #[test]
    fn later_write_replaces_earlier_in_same_set() {
        let mut set = ChangeSet::new("ui");
        set.write(p("a.ts"), b"one".to_vec());
        set.write(p("a.ts"), b"two".to_vec());
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&p("a.ts")).map(|b| b.as_ref()), Some(b"two".as_slice()));
    }

    #[test]
    fn describe_classifies_actions() {
        let mut set = ChangeSet::new("api");
        set.write(p("new.ts"), b"x".to_vec());
        set.write(p("old.ts"), b"y".to_vec());
        set.delete(p("gone.ts"));

        let changes = set.describe(|path| path.as_str() == "old.ts");
        let by_path: BTreeMap<_, _> = changes.iter().map(|c| (c.path.as_str(), c)).collect();

        assert_eq!(by_path["new.ts"].action, FileAction::Create);
        assert_eq!(by_path["old.ts"].action, FileAction::Modify);
        assert_eq!(by_path["gone.ts"].action, FileAction::Delete);
        assert!(by_path["gone.ts"].content_hash.is_zero());
        assert!(changes.iter().all(|c| c.owner == "api"));
    }
}
