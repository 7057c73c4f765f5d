//! Forge kernel: the invariants every build session is held to.
//!
//! - [`Phase`] transitions: forward-only except the listed backward loops
//! - [`SessionStatus`]/[`ComponentStatus`] tables; a session becomes terminal once
//! - [`Dag`]: component dependencies, depth levels and merge order
//! - [`AuditLog`]: hash-chained record of phase changes and generation attempts

pub mod audit;
pub mod dag;
pub mod error;
pub mod phase;
pub mod status;

pub use audit::{AuditEntry, AuditLog};
pub use dag::Dag;
pub use error::{GraphError, LogError, TransitionError};
pub use phase::{classify, validate_transition, Phase, TransitionKind};
pub use status::{ComponentStatus, SessionStatus};
