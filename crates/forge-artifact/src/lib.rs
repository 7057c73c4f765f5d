//! Forge Artifact Store
//!
//! Content-addressed workspace snapshots with copy-on-write revisions.
//!
//! # Core Concepts
//!
//! - [`ContentHash`]: 32-byte Blake3 hash for content addressing
//! - [`WorkspacePath`]: normalized workspace-relative path
//! - [`ChangeSet`]: one owner's staged writes
//! - [`SnapshotArena`]: append-only revisions over a persistent path index
//! - [`Snapshot`]: cheap immutable read view of one revision
//!
//! # Example
//!
//! ```rust
//! use forge_artifact::{SnapshotArena, WorkspacePath};
//! use std::sync::Arc;
//!
//! let mut arena = SnapshotArena::new();
//! let mut staging = arena.stage();
//! let path = WorkspacePath::new("src/index.ts").unwrap();
//! staging.put(path.clone(), Arc::from(&b"export {}"[..]), "shell");
//! let rev = arena.commit(staging, "shell").unwrap();
//!
//! assert_eq!(arena.head().revision(), rev);
//! assert!(arena.head().contains(&path));
//! ```

#![warn(unreachable_pub)]

mod arena;
mod change;
mod hash;
mod path;

/// Merkle roots and inclusion proofs
pub mod merkle;

pub use arena::{
    ArenaError, PathEntry, RevisionId, RevisionInfo, Snapshot, SnapshotArena, Staging,
};
pub use change::{ChangeSet, FileAction, FileChange};
pub use hash::{ContentHash, HashError};
pub use merkle::{InclusionProof, WorkspaceMerkleTree};
pub use path::{PathError, WorkspacePath};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
