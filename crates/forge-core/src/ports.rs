//! External collaborators
//!
//! Everything the engine does not own sits behind one of these traits:
//! code generation, contract drafting, architecture planning, secrets,
//! sandboxes, version control and deployment. In-memory adapters live in
//! [`crate::sandbox`] and [`crate::persistence`].

use crate::broadcast::BroadcastEntry;
use crate::component::InterfaceContract;
use crate::contract::{ContractDraft, ContractRequest, IntentContract, SuccessCriterion};
use crate::error::ForgeResult;
use crate::partition::ArchitecturePlan;
use crate::types::{AgentId, ComponentId, ContractId, SessionId};
use async_trait::async_trait;
use forge_artifact::{ChangeSet, RevisionId, Snapshot, WorkspacePath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Why a component is being generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// First build
    Build,
    /// Regenerate only the failing files, with diagnostics
    LocalFix,
    /// Regenerate the whole component with trace and failing assertions
    ComponentFix,
    /// Discard and regenerate from the interface contract
    ComponentRewrite,
    /// Regenerate as part of a feature-wide rewrite
    FeatureRewrite,
    /// Close an unsatisfied contract criterion
    GapFix,
    /// Templated repair; never reaches a generation service
    KnownFix,
}

impl GenerationMode {
    /// Only the written files change; the rest of the component is kept
    #[inline]
    #[must_use]
    pub fn is_overlay(self) -> bool {
        matches!(self, Self::LocalFix | Self::GapFix | Self::KnownFix)
    }

    /// Existing file contents are withheld from the prompt
    #[inline]
    #[must_use]
    pub fn starts_clean(self) -> bool {
        matches!(self, Self::Build | Self::ComponentRewrite | Self::FeatureRewrite)
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Build => "build",
            Self::LocalFix => "local-fix",
            Self::ComponentFix => "component-fix",
            Self::ComponentRewrite => "component-rewrite",
            Self::FeatureRewrite => "feature-rewrite",
            Self::GapFix => "gap-fix",
            Self::KnownFix => "known-fix",
        };
        f.write_str(name)
    }
}

/// Everything one agent call sees
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptContext {
    /// Session
    pub session_id: SessionId,
    /// Contract in force
    pub contract_id: ContractId,
    /// Component being built
    pub component_id: ComponentId,
    /// Component name
    pub component: String,
    /// Calling agent
    pub agent_id: AgentId,
    /// Agent slot within the component, zero-based
    pub agent_index: usize,
    /// Tournament candidate, zero-based
    pub candidate: usize,
    /// Why we are generating
    pub mode: GenerationMode,
    /// Every path the component may write
    pub owned_files: Vec<WorkspacePath>,
    /// Paths this agent is asked to produce
    pub target_files: Vec<WorkspacePath>,
    /// What the component promises and consumes
    pub interface: InterfaceContract,
    /// Criteria the component is responsible for
    pub criteria: Vec<SuccessCriterion>,
    /// Diagnostics from the failure being remediated
    pub diagnostics: Vec<String>,
    /// Current merged content of the target files, for fix modes
    pub existing: BTreeMap<WorkspacePath, String>,
    /// Broadcast entries published since this agent's last call
    pub broadcast: Vec<BroadcastEntry>,
}

/// One generated file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    /// Target path
    pub path: WorkspacePath,
    /// Full content
    pub content: String,
}

impl GeneratedFile {
    /// File from path and content
    #[must_use]
    pub fn new(path: WorkspacePath, content: impl Into<String>) -> Self {
        Self {
            path,
            content: content.into(),
        }
    }
}

/// Generation service response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Produced files
    pub files: Vec<GeneratedFile>,
    /// Model's explanation
    pub rationale: String,
    /// Cost of the call
    pub cost_usd: f64,
}

/// Untrusted, non-deterministic code generation
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Produce files for one agent call
    async fn generate(&self, context: PromptContext) -> ForgeResult<GenerationOutput>;
}

/// Turns a request into a draft contract
#[async_trait]
pub trait ContractDrafter: Send + Sync {
    /// Draft criteria, workflows and identity
    async fn draft(&self, request: &ContractRequest) -> ForgeResult<ContractDraft>;
}

/// Proposes components for a locked contract
#[async_trait]
pub trait ArchitecturePlanner: Send + Sync {
    /// Component specs with dependencies and file ownership
    async fn plan(&self, contract: &IntentContract) -> ForgeResult<ArchitecturePlan>;
}

/// Read-only secret lookup, used during INIT only
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when the secret does not exist
    async fn get_secret(&self, name: &str) -> ForgeResult<Option<String>>;
}

/// Result of a sandboxed command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Exit status
    pub exit_code: i32,
}

impl ExecOutput {
    /// Exit code zero
    #[inline]
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Isolated file tree plus command execution
#[async_trait]
pub trait WorkspaceSandbox: Send + Sync {
    /// Create or replace a file
    async fn write_file(&self, path: &WorkspacePath, content: &[u8]) -> ForgeResult<()>;
    /// File content, `None` if missing
    async fn read_file(&self, path: &WorkspacePath) -> ForgeResult<Option<Vec<u8>>>;
    /// Remove a file; missing files are ignored
    async fn delete_file(&self, path: &WorkspacePath) -> ForgeResult<()>;
    /// Run a shell command at the sandbox root
    async fn exec(&self, command: &str) -> ForgeResult<ExecOutput>;
}

/// Creates sandboxes: one per component candidate plus the shared one
pub trait SandboxFactory: Send + Sync {
    /// New empty sandbox labelled for logs
    ///
    /// # Errors
    /// [`crate::ForgeError::Sandbox`] if the sandbox cannot be provisioned
    fn create(&self, label: &str) -> ForgeResult<Arc<dyn WorkspaceSandbox>>;
}

/// Commit/rollback over the merged workspace
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Atomically apply a change set
    async fn commit(&self, changes: ChangeSet, message: &str) -> ForgeResult<RevisionId>;
    /// Make a past revision current again
    async fn rollback(&self, revision: RevisionId) -> ForgeResult<RevisionId>;
}

/// Where a finished build goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReceipt {
    /// Public location
    pub url: String,
    /// Revision that was shipped
    pub revision: RevisionId,
}

/// Hosting provider
#[async_trait]
pub trait DeployTarget: Send + Sync {
    /// Ship a merged snapshot
    async fn deploy(&self, session_id: SessionId, snapshot: &Snapshot) -> ForgeResult<DeployReceipt>;
}
