//! Error types for Forge Core
//!
//! Every failure in the engine is a [`ForgeError`] and surfaces to the phase
//! driver, which alone decides between local retry, escalation, a backward
//! phase loop, pausing and termination.

use forge_artifact::{ArenaError, PathError, WorkspacePath};
use forge_composition::{CompositionError, PathConflict};
use forge_kernel::{GraphError, TransitionError};
use serde::{Deserialize, Serialize};

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// Request too ambiguous to produce a contract
    #[error("contract generation failed: {reason}")]
    ContractGeneration {
        /// Why the draft was rejected
        reason: String,
        /// Measured ambiguity in `[0, 1]`
        ambiguity: f64,
        /// Questions the caller must answer before retrying
        questions: Vec<String>,
    },

    /// Mutation attempted on a locked contract
    #[error("contract {0} is locked")]
    ContractLocked(String),

    /// Component graph could not be built
    #[error("partition failed: {0}")]
    Partition(#[from] PartitionError),

    /// Overlapping writes; raised before anything is committed
    #[error("file conflict in {component}: {}", describe_conflicts(.conflicts))]
    FileConflict {
        /// Component whose write was rejected
        component: String,
        /// Offending paths
        conflicts: Vec<PathConflict>,
    },

    /// A checker errored, timed out or panicked
    #[error("checker {checker} crashed: {message}")]
    CheckerCrash {
        /// Checker name
        checker: String,
        /// Crash detail
        message: String,
    },

    /// Generation call did not return in time
    #[error("generation for {component} timed out after {timeout_ms}ms")]
    GenerationTimeout {
        /// Component being generated
        component: String,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// Generation service returned an error or unusable output
    #[error("generation failed for {component}: {message}")]
    Generation {
        /// Component being generated
        component: String,
        /// Detail
        message: String,
    },

    /// Level 4 failed; the session must pause
    #[error("escalation exhausted for signature {signature}")]
    EscalationExhausted {
        /// Error signature that could not be fixed
        signature: String,
    },

    /// Session cancelled
    #[error("abort requested")]
    AbortRequested,

    /// A configured budget ran out
    #[error("budget exhausted: {0}")]
    BudgetExhausted(BudgetKind),

    /// Illegal phase or status transition
    #[error("invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    /// Persistence backend failed
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Sandbox I/O or exec failed
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Required secret missing at INIT
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    /// Artifact store error
    #[error("artifact store error: {0}")]
    Arena(#[from] ArenaError),

    /// Invalid workspace path
    #[error("invalid path: {0}")]
    Path(#[from] PathError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown session
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Deployment failed
    #[error("deploy failed: {0}")]
    Deploy(String),
}

impl ForgeError {
    /// Retrying the same call may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GenerationTimeout { .. }
                | Self::Generation { .. }
                | Self::FileConflict { .. }
                | Self::CheckerCrash { .. }
                | Self::Sandbox(_)
        )
    }

    /// Only a human (or upstream system) can unblock this
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(
            self,
            Self::ContractGeneration { .. }
                | Self::EscalationExhausted { .. }
                | Self::SecretNotFound(_)
                | Self::Partition(_)
        )
    }

    /// Blocks a phase from completing; never treated as a pass
    #[inline]
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::Persistence(_))
    }

    /// Ends the session as aborted
    #[inline]
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::AbortRequested | Self::BudgetExhausted(_))
    }

    /// Build a file-conflict error from a composition error
    #[must_use]
    pub fn file_conflict(component: impl Into<String>, err: CompositionError) -> Self {
        let component = component.into();
        match err {
            CompositionError::Conflict { conflicts } => Self::FileConflict {
                component,
                conflicts,
            },
            CompositionError::UnknownOwner(_) => Self::FileConflict {
                component,
                conflicts: Vec::new(),
            },
        }
    }

    /// Paths involved in a conflict, empty otherwise
    #[must_use]
    pub fn conflict_paths(&self) -> Vec<WorkspacePath> {
        match self {
            Self::FileConflict { conflicts, .. } => conflicts.iter().map(|c| c.path.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

fn describe_conflicts(conflicts: &[PathConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Which budget ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    /// Wall-clock session time
    Time,
    /// Cumulative generation cost
    Cost,
    /// Number of generation calls
    GenerationCalls,
    /// Satisfaction gate rounds
    SatisfactionRounds,
    /// Driver loop iterations
    DriverSteps,
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Time => "session time",
            Self::Cost => "cost",
            Self::GenerationCalls => "generation calls",
            Self::SatisfactionRounds => "satisfaction rounds",
            Self::DriverSteps => "driver steps",
        };
        f.write_str(name)
    }
}

/// Component partitioning errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    /// Dependency cycle between named components
    #[error("dependency cycle between {}; promote the shared portion into its own component", .members.join(", "))]
    Cycle {
        /// Component names in the cycle
        members: Vec<String>,
    },

    /// Dependency on an undeclared component
    #[error("component {component} depends on unknown component {dependency}")]
    UnknownDependency {
        /// Declaring component
        component: String,
        /// Missing dependency
        dependency: String,
    },

    /// Two components claim the same file
    #[error("{path} is owned by both {first} and {second}")]
    OverlappingOwnership {
        /// Contested path
        path: String,
        /// First claimant
        first: String,
        /// Second claimant
        second: String,
    },

    /// Two components share a name
    #[error("duplicate component name: {0}")]
    DuplicateName(String),

    /// Planner returned nothing to build
    #[error("architecture plan has no components")]
    Empty,

    /// Underlying graph error
    #[error("graph error: {0}")]
    Graph(String),
}

impl From<GraphError> for PartitionError {
    fn from(err: GraphError) -> Self {
        Self::Graph(err.to_string())
    }
}

/// Convenience alias
pub type ForgeResult<T> = Result<T, ForgeError>;
