//! Forge Core - build orchestration engine
//!
//! Turns a natural-language request into a locked intent contract, splits the
//! application into components with disjoint file ownership, builds them in
//! parallel, merges them into one workspace, and drives the result through
//! integration, functional tests, contract satisfaction and an independent
//! verification swarm. Failures climb an escalation ladder until they are
//! fixed or the session pauses for a human.
//!
//! # Example
//!
//! ```rust,ignore
//! use forge_core::{BuildEngine, Collaborators, ContractRequest, ForgeConfig};
//!
//! # async fn example(generator: std::sync::Arc<dyn forge_core::GenerationService>,
//! #                  planner: std::sync::Arc<dyn forge_core::ArchitecturePlanner>) -> forge_core::ForgeResult<()> {
//! let engine = BuildEngine::new(ForgeConfig::default(), Collaborators::in_memory(generator, planner));
//! let id = engine
//!     .start_build(ContractRequest::new("A todo app. It must persist todos to src/store.ts."))
//!     .await?;
//! let session = engine.wait(id).await?;
//! println!("{:?} in {}", session.status, session.current_phase);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod broadcast;
pub mod budget;
pub mod checkers;
pub mod component;
pub mod config;
pub mod contract;
pub mod coordinator;
pub mod driver;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod events;
pub mod functional;
pub mod gate;
pub mod integration;
pub mod partition;
pub mod persistence;
pub mod ports;
pub mod sandbox;
pub mod session;
pub mod simulator;
pub mod swarm;
pub mod types;
pub mod workspace;

pub use config::ForgeConfig;
pub use contract::{ContractAmendment, ContractRegistry, ContractRequest, IntentContract, VerificationMethod};
pub use engine::{BuildEngine, Collaborators};
pub use error::{BudgetKind, ForgeError, ForgeResult, PartitionError};
pub use escalation::{EscalationLevel, KnownFixLibrary};
pub use events::{BuildSummary, EventKind, ProgressEvent};
pub use partition::{ArchitecturePlan, ComponentSpec};
pub use ports::{
    ArchitecturePlanner, ContractDrafter, CredentialStore, DeployTarget, GenerationService, SandboxFactory,
    WorkspaceSandbox,
};
pub use session::BuildSession;
pub use swarm::{Finding, Severity, VerificationSwarm};
pub use types::{ComponentId, ContractId, CriterionId, SessionId};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
