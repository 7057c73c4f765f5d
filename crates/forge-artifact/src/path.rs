//! Workspace-relative file paths
//!
//! [`WorkspacePath`] is the key of every ownership claim, write and merge.
//! Paths are normalized on construction so two spellings of the same file
//! can never slip past the single-writer checks.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Normalized, relative, `/`-separated path inside a workspace
///
/// # Examples
/// - `src/app.tsx`
/// - `./src//lib/../app.tsx` normalizes to `src/app.tsx`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkspacePath(String);

impl WorkspacePath {
    /// Parse and normalize a path
    ///
    /// # Errors
    /// - [`PathError::Empty`] for empty input
    /// - [`PathError::Absolute`] for paths starting with `/` or a drive letter
    /// - [`PathError::EscapesRoot`] when `..` climbs above the workspace
    /// - [`PathError::InvalidCharacter`] for NUL or backslash
    pub fn new(raw: impl AsRef<str>) -> Result<Self, PathError> {
        let raw = raw.as_ref();
        if raw.trim().is_empty() {
            return Err(PathError::Empty);
        }
        if raw.contains('\0') || raw.contains('\\') {
            return Err(PathError::InvalidCharacter(raw.to_string()));
        }
        if raw.starts_with('/') || raw.chars().nth(1) == Some(':') {
            return Err(PathError::Absolute(raw.to_string()));
        }

        let mut segments: Vec<&str> = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PathError::EscapesRoot(raw.to_string()));
                    }
                }
                other => segments.push(other),
            }
        }

        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(Self(segments.join("/")))
    }

    /// Path as a string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final segment
    #[inline]
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Extension without the dot
    #[must_use]
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(&name[idx + 1..]),
        }
    }

    /// Parent directory, `None` for top-level files
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.0.rfind('/').map(|idx| &self.0[..idx])
    }

    /// Resolve a relative reference (`./x`, `../y`) against this file's directory
    ///
    /// # Errors
    /// Returns an error if the result escapes the workspace root
    pub fn resolve_relative(&self, reference: &str) -> Result<Self, PathError> {
        match self.parent() {
            Some(dir) => Self::new(format!("{dir}/{reference}")),
            None => Self::new(reference),
        }
    }

    /// True if this path lives under `dir` (a `/`-separated prefix)
    #[must_use]
    pub fn is_under(&self, dir: &str) -> bool {
        let dir = dir.trim_end_matches('/');
        dir.is_empty()
            || self.0 == dir
            || (self.0.starts_with(dir) && self.0.as_bytes().get(dir.len()) == Some(&b'/'))
    }
}

impl Display for WorkspacePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkspacePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for WorkspacePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for WorkspacePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for WorkspacePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Errors related to workspace paths
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Nothing left after normalization
    #[error("path is empty")]
    Empty,

    /// Absolute paths are not workspace paths
    #[error("absolute path not allowed: {0}")]
    Absolute(String),

    /// `..` climbed above the root
    #[error("path escapes workspace root: {0}")]
    EscapesRoot(String),

    /// NUL or backslash
    #[error("invalid character in path: {0}")]
    InvalidCharacter(String),
}
