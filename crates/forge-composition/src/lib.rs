//! Forge Composition
//!
//! Single-writer ownership for parallel component builds.
//!
//! # Core Concepts
//!
//! - [`OwnershipClaims`]: disjoint `path → component` claims
//! - [`PathWriteLedger`]: per-path serialized writes inside one component
//! - [`SingleWriterStrategy`]: validates change sets before they are merged
//! - [`CompositionError`]: conflicts with every offending path attached

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod claims;
mod conflict;
mod ledger;
mod single_writer;

pub use claims::{overlap, OwnershipClaims};
pub use conflict::{CompositionError, ConflictKind, PathConflict};
pub use ledger::{PathWriteLedger, WriteOutcome, WriteRecord};
pub use single_writer::{CompositionStrategy, SingleWriterStrategy, Validation};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
