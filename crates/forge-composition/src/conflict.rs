//! Conflict diagnostics and the composition error type

use forge_artifact::WorkspacePath;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why two writers collided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Two owners claim the same path
    OverlappingClaims,
    /// Two agents wrote different content to one path
    ConcurrentWrite,
    /// A write targets a path owned by another, already merged component
    MergedByOther,
    /// A write targets a path outside the writer's claim
    OutOfScope,
}

/// One conflicting path, with both parties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConflict {
    /// The contested path
    pub path: WorkspacePath,
    /// Conflict kind
    pub kind: ConflictKind,
    /// Writer that hit the conflict
    pub writer: String,
    /// Existing holder, if any
    pub holder: Option<String>,
}

impl fmt::Display for PathConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.holder {
            Some(holder) => write!(f, "{} ({:?}: {} vs {})", self.path, self.kind, self.writer, holder),
            None => write!(f, "{} ({:?}: {})", self.path, self.kind, self.writer),
        }
    }
}

/// Errors raised while validating or recording writes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositionError {
    /// One or more paths conflict; nothing was applied
    #[error("write conflict on {} path(s): {}", .conflicts.len(), describe(.conflicts))]
    Conflict {
        /// Every conflicting path found
        conflicts: Vec<PathConflict>,
    },

    /// Owner id not registered
    #[error("unknown owner: {0}")]
    UnknownOwner(String),
}

impl CompositionError {
    /// Single-path conflict
    #[inline]
    #[must_use]
    pub fn conflict(conflict: PathConflict) -> Self {
        Self::Conflict {
            conflicts: vec![conflict],
        }
    }

    /// Conflicting paths, empty for other variants
    #[must_use]
    pub fn paths(&self) -> Vec<WorkspacePath> {
        match self {
            Self::Conflict { conflicts } => conflicts.iter().map(|c| c.path.clone()).collect(),
            Self::UnknownOwner(_) => Vec::new(),
        }
    }
}

fn describe(conflicts: &[PathConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
