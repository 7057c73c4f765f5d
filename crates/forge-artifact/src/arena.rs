//! Content-addressed snapshot arena
//!
//! The arena stores every blob once, keyed by its [`ContentHash`], and keeps
//! an append-only list of revisions. Each revision owns a persistent
//! `path → entry` index ([`im::OrdMap`]), so a commit clones the parent index
//! in O(1) and only touches the paths it changes.
//!
//! Writers stage work in a [`Staging`] built from the current head. Nothing
//! is visible to readers until [`SnapshotArena::commit`] swaps the head; a
//! dropped staging leaves the arena untouched.

use crate::change::{ChangeSet, FileAction, FileChange};
use crate::hash::ContentHash;
use crate::merkle::WorkspaceMerkleTree;
use crate::path::WorkspacePath;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Monotonic revision number; `0` is the empty root revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RevisionId(u64);

impl RevisionId {
    /// Root revision
    pub const ROOT: Self = Self(0);

    /// Raw number
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// One indexed file in a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    /// Content address
    pub hash: ContentHash,
    /// Revision that last wrote this path
    pub revision: RevisionId,
    /// Component that owns this path
    pub owner: String,
}

/// Metadata of a committed revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    /// Revision id
    pub id: RevisionId,
    /// Parent revision, `None` for root
    pub parent: Option<RevisionId>,
    /// Commit message
    pub message: String,
    /// Merkle root of the indexed files
    pub root: ContentHash,
    /// Changes applied relative to the parent
    pub changes: Vec<FileChange>,
}

#[derive(Debug, Clone)]
struct Revision {
    info: RevisionInfo,
    index: im::OrdMap<WorkspacePath, PathEntry>,
}

/// Immutable read view of one revision
///
/// Cheap to clone; shares structure with the arena.
#[derive(Clone)]
pub struct Snapshot {
    revision: RevisionId,
    root: ContentHash,
    index: im::OrdMap<WorkspacePath, PathEntry>,
    blobs: im::HashMap<ContentHash, Arc<[u8]>>,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("revision", &self.revision)
            .field("files", &self.index.len())
            .field("root", &self.root.short())
            .finish()
    }
}

impl Snapshot {
    /// Revision this view was taken at
    #[inline]
    #[must_use]
    pub fn revision(&self) -> RevisionId {
        self.revision
    }

    /// Merkle root of the view
    #[inline]
    #[must_use]
    pub fn root(&self) -> ContentHash {
        self.root
    }

    /// File content
    #[must_use]
    pub fn read(&self, path: &WorkspacePath) -> Option<Arc<[u8]>> {
        let entry = self.index.get(path)?;
        self.blobs.get(&entry.hash).cloned()
    }

    /// File content as UTF-8, lossy
    #[must_use]
    pub fn read_text(&self, path: &WorkspacePath) -> Option<String> {
        self.read(path).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Index entry for a path
    #[must_use]
    pub fn entry(&self, path: &WorkspacePath) -> Option<&PathEntry> {
        self.index.get(path)
    }

    /// Owning component of a path
    #[must_use]
    pub fn owner_of(&self, path: &WorkspacePath) -> Option<&str> {
        self.index.get(path).map(|entry| entry.owner.as_str())
    }

    /// True if the path exists
    #[must_use]
    pub fn contains(&self, path: &WorkspacePath) -> bool {
        self.index.contains_key(path)
    }

    /// All paths in order
    pub fn paths(&self) -> impl Iterator<Item = &WorkspacePath> {
        self.index.keys()
    }

    /// Paths owned by `owner`
    pub fn paths_owned_by<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a WorkspacePath> {
        self.index
            .iter()
            .filter(move |(_, entry)| entry.owner == owner)
            .map(|(path, _)| path)
    }

    /// Number of files
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// No files
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Merkle tree for inclusion proofs
    #[must_use]
    pub fn merkle_tree(&self) -> WorkspaceMerkleTree {
        WorkspaceMerkleTree::from_entries(self.index.iter().map(|(path, entry)| (path, &entry.hash)))
    }

    /// Uncommitted view of this snapshot with `set` applied on top
    ///
    /// Used to inspect candidate output before it is merged. The arena is
    /// not touched and the view keeps this snapshot's revision id.
    #[must_use]
    pub fn overlay(&self, set: &ChangeSet) -> Snapshot {
        let mut next = self.clone();
        for (path, data) in set.entries() {
            match data {
                Some(bytes) => {
                    let hash = ContentHash::compute(bytes);
                    if !next.blobs.contains_key(&hash) {
                        next.blobs.insert(hash, Arc::clone(bytes));
                    }
                    next.index.insert(
                        path.clone(),
                        PathEntry {
                            hash,
                            revision: self.revision,
                            owner: set.owner().to_string(),
                        },
                    );
                }
                None => {
                    next.index.remove(path);
                }
            }
        }
        next.root = root_of(&next.index);
        next
    }
}

/// Uncommitted writes against a base revision
#[derive(Debug, Clone)]
pub struct Staging {
    base: RevisionId,
    index: im::OrdMap<WorkspacePath, PathEntry>,
    blobs: im::HashMap<ContentHash, Arc<[u8]>>,
    changes: Vec<FileChange>,
}

impl Staging {
    /// Base revision
    #[inline]
    #[must_use]
    pub fn base(&self) -> RevisionId {
        self.base
    }

    /// Stage one file write
    pub fn put(&mut self, path: WorkspacePath, content: Arc<[u8]>, owner: &str) {
        let hash = ContentHash::compute(&content);
        let action = if self.index.contains_key(&path) {
            FileAction::Modify
        } else {
            FileAction::Create
        };
        if !self.blobs.contains_key(&hash) {
            self.blobs.insert(hash, content);
        }
        self.changes.push(FileChange {
            path: path.clone(),
            action,
            content_hash: hash,
            owner: owner.to_string(),
        });
        // Revision is filled in at commit time
        self.index.insert(
            path,
            PathEntry {
                hash,
                revision: self.base,
                owner: owner.to_string(),
            },
        );
    }

    /// Stage one delete; missing paths are ignored
    pub fn remove(&mut self, path: &WorkspacePath, owner: &str) {
        if self.index.remove(path).is_some() {
            self.changes.push(FileChange {
                path: path.clone(),
                action: FileAction::Delete,
                content_hash: ContentHash::default(),
                owner: owner.to_string(),
            });
        }
    }

    /// Stage a whole change set
    pub fn apply(&mut self, set: &ChangeSet) {
        for (path, data) in set.entries() {
            match data {
                Some(bytes) => self.put(path.clone(), Arc::clone(bytes), set.owner()),
                None => self.remove(path, set.owner()),
            }
        }
    }

    /// Number of staged changes
    #[inline]
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }
}

/// Append-only store of workspace revisions
#[derive(Debug, Clone)]
pub struct SnapshotArena {
    revisions: Vec<Revision>,
    blobs: im::HashMap<ContentHash, Arc<[u8]>>,
    head: usize,
}

impl Default for SnapshotArena {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotArena {
    /// Arena holding only the empty root revision
    #[must_use]
    pub fn new() -> Self {
        let root = Revision {
            info: RevisionInfo {
                id: RevisionId::ROOT,
                parent: None,
                message: "root".to_string(),
                root: ContentHash::default(),
                changes: Vec::new(),
            },
            index: im::OrdMap::new(),
        };
        Self {
            revisions: vec![root],
            blobs: im::HashMap::new(),
            head: 0,
        }
    }

    /// Current head revision id
    #[inline]
    #[must_use]
    pub fn head_id(&self) -> RevisionId {
        self.revisions[self.head].info.id
    }

    /// Read view of the head
    #[must_use]
    pub fn head(&self) -> Snapshot {
        self.view(self.head)
    }

    /// Read view of any revision
    ///
    /// # Errors
    /// [`ArenaError::UnknownRevision`] if the id was never committed
    pub fn snapshot(&self, id: RevisionId) -> Result<Snapshot, ArenaError> {
        let slot = self.slot(id)?;
        Ok(self.view(slot))
    }

    /// Revision metadata
    ///
    /// # Errors
    /// [`ArenaError::UnknownRevision`] if the id was never committed
    pub fn info(&self, id: RevisionId) -> Result<&RevisionInfo, ArenaError> {
        let slot = self.slot(id)?;
        Ok(&self.revisions[slot].info)
    }

    /// All revisions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &RevisionInfo> {
        self.revisions.iter().map(|rev| &rev.info)
    }

    /// Start staging against the current head
    #[must_use]
    pub fn stage(&self) -> Staging {
        let head = &self.revisions[self.head];
        Staging {
            base: head.info.id,
            index: head.index.clone(),
            blobs: self.blobs.clone(),
            changes: Vec::new(),
        }
    }

    /// Publish a staging as the new head
    ///
    /// # Errors
    /// [`ArenaError::StaleBase`] if another commit landed after staging began
    pub fn commit(&mut self, mut staging: Staging, message: impl Into<String>) -> Result<RevisionId, ArenaError> {
        let head = self.head_id();
        if staging.base != head {
            return Err(ArenaError::StaleBase {
                base: staging.base,
                head,
            });
        }

        let id = self.next_id();
        for change in &staging.changes {
            if change.action != FileAction::Delete {
                if let Some(entry) = staging.index.get_mut(&change.path) {
                    entry.revision = id;
                }
            }
        }

        let root = root_of(&staging.index);
        self.blobs = staging.blobs;
        self.revisions.push(Revision {
            info: RevisionInfo {
                id,
                parent: Some(head),
                message: message.into(),
                root,
                changes: staging.changes,
            },
            index: staging.index,
        });
        self.head = self.revisions.len() - 1;
        Ok(id)
    }

    /// Make `target`'s file set the head again
    ///
    /// History stays append-only: the rollback is recorded as a new revision
    /// whose index equals the target's.
    ///
    /// # Errors
    /// [`ArenaError::UnknownRevision`] if the target was never committed
    pub fn rollback(&mut self, target: RevisionId) -> Result<RevisionId, ArenaError> {
        let slot = self.slot(target)?;
        let index = self.revisions[slot].index.clone();
        let root = self.revisions[slot].info.root;
        let id = self.next_id();
        self.revisions.push(Revision {
            info: RevisionInfo {
                id,
                parent: Some(self.head_id()),
                message: format!("rollback to {target}"),
                root,
                changes: Vec::new(),
            },
            index,
        });
        self.head = self.revisions.len() - 1;
        Ok(id)
    }

    fn view(&self, slot: usize) -> Snapshot {
        let rev = &self.revisions[slot];
        Snapshot {
            revision: rev.info.id,
            root: rev.info.root,
            index: rev.index.clone(),
            blobs: self.blobs.clone(),
        }
    }

    fn slot(&self, id: RevisionId) -> Result<usize, ArenaError> {
        usize::try_from(id.0)
            .ok()
            .filter(|slot| *slot < self.revisions.len())
            .ok_or(ArenaError::UnknownRevision(id))
    }

    fn next_id(&self) -> RevisionId {
        RevisionId(self.revisions.len() as u64)
    }
}

fn root_of(index: &im::OrdMap<WorkspacePath, PathEntry>) -> ContentHash {
    WorkspaceMerkleTree::from_entries(index.iter().map(|(path, entry)| (path, &entry.hash))).root()
}

/// Errors from the snapshot arena
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    /// Revision id not present
    #[error("unknown revision {0}")]
    UnknownRevision(RevisionId),

    /// Head moved after staging began
    #[error("stale staging: based on {base}, head is {head}")]
    StaleBase {
        /// Staging base
        base: RevisionId,
        /// Current head
        head: RevisionId,
    },
}
