//! Engine façade
//!
//! Owns the contract registry, the known-fix library shared by every
//! session, and one handle per session. Each session runs on its own tokio
//! task behind a [`PhaseDriver`]; callers observe it through
//! [`BuildEngine::get_session_status`] and the progress channel.

use crate::broadcast::BroadcastLog;
use crate::budget::BudgetTracker;
use crate::component::{AttemptLog, Component, ComponentTable, GenerationAttempt};
use crate::config::ForgeConfig;
use crate::contract::{
    ContractAmendment, ContractEngine, ContractRegistry, ContractRequest, HeuristicDrafter, IntentContract,
};
use crate::coordinator::BuildResources;
use crate::driver::{PhaseDriver, SessionServices};
use crate::error::{ForgeError, ForgeResult};
use crate::escalation::KnownFixLibrary;
use crate::events::{EventKind, ProgressChannel, ProgressEvent};
use crate::persistence::{MemoryStore, Persistence};
use crate::ports::{
    ArchitecturePlanner, ContractDrafter, CredentialStore, DeployTarget, GenerationService, SandboxFactory,
};
use crate::sandbox::{MemoryCredentialStore, MemorySandboxFactory};
use crate::session::BuildSession;
use crate::swarm::VerificationSwarm;
use crate::types::{ContractId, SessionId};
use crate::workspace::SharedWorkspace;
use dashmap::DashMap;
use forge_artifact::Snapshot;
use forge_kernel::{AuditEntry, AuditLog, SessionStatus, TransitionError};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// External services one engine talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Code generation
    pub generator: Arc<dyn GenerationService>,
    /// Contract drafting
    pub drafter: Arc<dyn ContractDrafter>,
    /// Architecture planning
    pub planner: Arc<dyn ArchitecturePlanner>,
    /// Secrets
    pub credentials: Arc<dyn CredentialStore>,
    /// Sandbox provisioning
    pub sandboxes: Arc<dyn SandboxFactory>,
    /// Optional hosting target
    pub deploy: Option<Arc<dyn DeployTarget>>,
    /// Durable state
    pub persistence: Arc<dyn Persistence>,
}

impl Collaborators {
    /// In-memory adapters around a generator and a planner
    #[must_use]
    pub fn in_memory(generator: Arc<dyn GenerationService>, planner: Arc<dyn ArchitecturePlanner>) -> Self {
        Self {
            generator,
            drafter: Arc::new(HeuristicDrafter),
            planner,
            credentials: Arc::new(MemoryCredentialStore::new()),
            sandboxes: Arc::new(MemorySandboxFactory::new()),
            deploy: None,
            persistence: Arc::new(MemoryStore::new()),
        }
    }

    /// Replace the drafter
    #[must_use]
    pub fn with_drafter(mut self, drafter: Arc<dyn ContractDrafter>) -> Self {
        self.drafter = drafter;
        self
    }

    /// Replace the credential store
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Replace the sandbox factory
    #[must_use]
    pub fn with_sandboxes(mut self, sandboxes: Arc<dyn SandboxFactory>) -> Self {
        self.sandboxes = sandboxes;
        self
    }

    /// Enable DEPLOY
    #[must_use]
    pub fn with_deploy(mut self, deploy: Arc<dyn DeployTarget>) -> Self {
        self.deploy = Some(deploy);
        self
    }

    /// Replace the store
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = persistence;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("deploy", &self.deploy.is_some())
            .finish_non_exhaustive()
    }
}

/// Per-session state that outlives a single driver run
struct SessionHandle {
    session: Arc<RwLock<BuildSession>>,
    contract: RwLock<Arc<IntentContract>>,
    table: Arc<ComponentTable>,
    workspace: Arc<SharedWorkspace>,
    attempts: Arc<AttemptLog>,
    audit: Arc<AuditLog>,
    broadcast: Arc<BroadcastLog>,
    cancel: Mutex<CancellationToken>,
    task: tokio::sync::Mutex<Option<JoinHandle<BuildSession>>>,
}

impl SessionHandle {
    fn id(&self) -> SessionId {
        self.session.read().id
    }
}

/// Build orchestration engine
pub struct BuildEngine {
    config: ForgeConfig,
    collaborators: Collaborators,
    contracts: ContractEngine,
    registry: Arc<ContractRegistry>,
    known_fixes: Arc<KnownFixLibrary>,
    swarm: Arc<VerificationSwarm>,
    progress: Arc<ProgressChannel>,
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
}

impl fmt::Debug for BuildEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildEngine")
            .field("sessions", &self.sessions.len())
            .field("contracts", &self.registry.len())
            .field("known_fixes", &self.known_fixes.len())
            .finish_non_exhaustive()
    }
}

impl BuildEngine {
    /// Engine with the standard swarm and the seeded fix library
    #[must_use]
    pub fn new(config: ForgeConfig, collaborators: Collaborators) -> Self {
        let contracts = ContractEngine::new(
            Arc::clone(&collaborators.drafter),
            config.contract.ambiguity_threshold,
        );
        let swarm = Arc::new(VerificationSwarm::standard(&config.swarm));
        Self {
            config,
            collaborators,
            contracts,
            registry: Arc::new(ContractRegistry::new()),
            known_fixes: Arc::new(KnownFixLibrary::new()),
            swarm,
            progress: Arc::new(ProgressChannel::new()),
            sessions: DashMap::new(),
        }
    }

    /// Replace the verification swarm
    #[must_use]
    pub fn with_swarm(mut self, swarm: VerificationSwarm) -> Self {
        self.swarm = Arc::new(swarm);
        self
    }

    /// Replace the known-fix library
    #[must_use]
    pub fn with_known_fixes(mut self, library: Arc<KnownFixLibrary>) -> Self {
        self.known_fixes = library;
        self
    }

    /// Lock a contract for `request` and start building it
    ///
    /// # Errors
    /// [`ForgeError::ContractGeneration`] when the request is too ambiguous;
    /// no session is created
    pub async fn start_build(&self, request: ContractRequest) -> ForgeResult<SessionId> {
        let contract = self.contracts.create_contract(&request).await?;
        self.start_with_contract(contract)
    }

    /// Start a session for an already locked contract
    ///
    /// # Errors
    /// [`ForgeError::ContractGeneration`] if the contract is not locked
    pub fn start_with_contract(&self, contract: IntentContract) -> ForgeResult<SessionId> {
        let contract = match self.registry.get(contract.id()) {
            Some(registered) if registered.content_hash() == contract.content_hash() => registered,
            Some(_) => return Err(ForgeError::ContractLocked(contract.id().to_string())),
            None => self.registry.insert(contract)?,
        };

        let session = BuildSession::new(contract.id());
        let id = session.id;
        let shared = self.collaborators.sandboxes.create(&format!("{id}-shared"))?;
        let handle = Arc::new(SessionHandle {
            session: Arc::new(RwLock::new(session)),
            contract: RwLock::new(Arc::clone(&contract)),
            table: Arc::new(ComponentTable::default()),
            workspace: Arc::new(SharedWorkspace::new(shared)),
            attempts: Arc::new(AttemptLog::new()),
            audit: Arc::new(AuditLog::new()),
            broadcast: Arc::new(BroadcastLog::new()),
            cancel: Mutex::new(CancellationToken::new()),
            task: tokio::sync::Mutex::new(None),
        });
        handle
            .audit
            .append(id.to_string(), "engine", "start", contract.id().to_string());
        self.progress.emit(id, EventKind::Started {
            contract_id: contract.id(),
        });
        tracing::info!(session = %id, contract = %contract.id(), criteria = contract.criteria().len(), "session started");

        self.sessions.insert(id, Arc::clone(&handle));
        self.spawn(&handle);
        Ok(id)
    }

    fn spawn(&self, handle: &Arc<SessionHandle>) {
        let cancel = CancellationToken::new();
        *handle.cancel.lock() = cancel.clone();
        let contract = Arc::clone(&handle.contract.read());
        let build = BuildResources {
            generator: Arc::clone(&self.collaborators.generator),
            sandboxes: Arc::clone(&self.collaborators.sandboxes),
            swarm: Arc::clone(&self.swarm),
            workspace: Arc::clone(&handle.workspace),
            broadcast: Arc::clone(&handle.broadcast),
            budget: Arc::new(BudgetTracker::new(self.config.budget.clone())),
            attempts: Arc::clone(&handle.attempts),
            audit: Arc::clone(&handle.audit),
            progress: Arc::clone(&self.progress),
        };
        let services = SessionServices {
            planner: Arc::clone(&self.collaborators.planner),
            credentials: Arc::clone(&self.collaborators.credentials),
            deploy: self.collaborators.deploy.clone(),
            persistence: Arc::clone(&self.collaborators.persistence),
            known_fixes: Arc::clone(&self.known_fixes),
            build,
        };
        let driver = PhaseDriver::new(
            Arc::clone(&handle.session),
            contract,
            self.config.clone(),
            services,
            Arc::clone(&handle.table),
            cancel,
        );
        let task = tokio::spawn(driver.run());
        // The handle was just created or its previous task has finished
        match handle.task.try_lock() {
            Ok(mut slot) => *slot = Some(task),
            Err(_) => tracing::error!(session = %handle.id(), "driver slot busy; task detached"),
        }
    }

    fn handle(&self, id: SessionId) -> ForgeResult<Arc<SessionHandle>> {
        self.sessions
            .get(&id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| ForgeError::SessionNotFound(id.to_string()))
    }

    /// Current session state
    ///
    /// # Errors
    /// [`ForgeError::SessionNotFound`] if neither this engine nor the store
    /// knows the session
    pub async fn get_session_status(&self, id: SessionId) -> ForgeResult<BuildSession> {
        if let Ok(handle) = self.handle(id) {
            return Ok(handle.session.read().clone());
        }
        self.collaborators
            .persistence
            .load_session(id)
            .await?
            .ok_or_else(|| ForgeError::SessionNotFound(id.to_string()))
    }

    /// Request an abort; in-flight merges roll back
    ///
    /// # Errors
    /// [`ForgeError::SessionNotFound`] for unknown sessions
    pub async fn cancel(&self, id: SessionId) -> ForgeResult<()> {
        let handle = self.handle(id)?;
        handle.cancel.lock().cancel();
        tracing::info!(session = %id, "cancel requested");

        let running = handle.task.lock().await.as_ref().is_some_and(|t| !t.is_finished());
        if running {
            return Ok(());
        }
        // No driver to observe the token: a paused session aborts here
        let aborted = {
            let mut session = handle.session.write();
            if session.is_terminal() {
                None
            } else {
                let from = session.current_phase;
                session.abort("cancelled by caller")?;
                Some((from, session.clone()))
            }
        };
        if let Some((from, session)) = aborted {
            if !from.is_terminal() {
                self.progress.emit(id, EventKind::PhaseTransition {
                    from,
                    to: forge_kernel::Phase::Terminal,
                    kind: forge_kernel::TransitionKind::Abort,
                });
            }
            self.progress.emit(id, EventKind::StatusChanged {
                status: SessionStatus::Aborted,
            });
            self.progress.emit(id, EventKind::Failed {
                reason: "cancelled by caller".into(),
            });
            self.collaborators.persistence.save_session(&session).await?;
        }
        Ok(())
    }

    /// Wait for the running driver to stop, then return the session
    ///
    /// # Errors
    /// [`ForgeError::SessionNotFound`] for unknown sessions
    pub async fn wait(&self, id: SessionId) -> ForgeResult<BuildSession> {
        let handle = self.handle(id)?;
        let task = handle.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(session = %id, error = %err, "driver task failed");
            }
        }
        let session = handle.session.read().clone();
        Ok(session)
    }

    /// Live progress for every session
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Every event emitted for `id`
    #[must_use]
    pub fn history(&self, id: SessionId) -> Vec<ProgressEvent> {
        self.progress.history(id)
    }

    /// Restart a paused session, or one loaded from the store, from INIT
    ///
    /// # Errors
    /// - [`ForgeError::SessionNotFound`] if the session is unknown
    /// - [`ForgeError::Config`] if its driver is still running
    /// - [`ForgeError::InvalidTransition`] if it is terminal
    pub async fn resume(&self, id: SessionId) -> ForgeResult<()> {
        let handle = match self.handle(id) {
            Ok(handle) => handle,
            Err(_) => self.restore(id).await?,
        };
        self.ensure_idle(&handle).await?;
        handle.session.write().resume()?;
        tracing::info!(session = %id, "session resumed");
        self.progress.emit(id, EventKind::StatusChanged {
            status: SessionStatus::Building,
        });
        handle.audit.append(id.to_string(), "engine", "resume", "init");
        self.spawn(&handle);
        Ok(())
    }

    /// Replace the contract of a paused session and rebuild
    ///
    /// The old contract stays registered; the new one records what it
    /// supersedes.
    ///
    /// # Errors
    /// - [`ForgeError::InvalidTransition`] unless the session is paused
    /// - [`ForgeError::ContractGeneration`] if the amendment empties the
    ///   contract
    pub async fn amend_contract(&self, id: SessionId, amendment: ContractAmendment) -> ForgeResult<ContractId> {
        let handle = match self.handle(id) {
            Ok(handle) => handle,
            Err(_) => self.restore(id).await?,
        };
        self.ensure_idle(&handle).await?;
        let status = handle.session.read().status;
        if status != SessionStatus::PausedNeedsInput {
            return Err(TransitionError::Illegal {
                machine: "session",
                from: format!("{status:?}"),
                to: "amended".into(),
            }
            .into());
        }

        let note = amendment.note.clone();
        let current = Arc::clone(&handle.contract.read());
        let amended = self.registry.insert(current.amend(amendment)?)?;
        self.collaborators.persistence.save_contract(&amended).await?;
        {
            let mut session = handle.session.write();
            session.adopt_contract(amended.id());
            session.resume()?;
        }
        *handle.contract.write() = Arc::clone(&amended);
        handle.audit.append(
            id.to_string(),
            "engine",
            format!("amend {} -> {}", current.id(), amended.id()),
            note,
        );
        tracing::info!(session = %id, from = %current.id(), to = %amended.id(), "contract amended");
        self.progress.emit(id, EventKind::StatusChanged {
            status: SessionStatus::Building,
        });
        self.spawn(&handle);
        Ok(amended.id())
    }

    async fn ensure_idle(&self, handle: &SessionHandle) -> ForgeResult<()> {
        let running = handle.task.lock().await.as_ref().is_some_and(|t| !t.is_finished());
        if running {
            return Err(ForgeError::Config(format!("session {} is still running", handle.id())));
        }
        Ok(())
    }

    /// Rebuild a handle for a session this engine did not start
    async fn restore(&self, id: SessionId) -> ForgeResult<Arc<SessionHandle>> {
        let store = &self.collaborators.persistence;
        let session = store
            .load_session(id)
            .await?
            .ok_or_else(|| ForgeError::SessionNotFound(id.to_string()))?;
        let contract = match self.registry.get(session.contract_id) {
            Some(contract) => contract,
            None => {
                let loaded = store
                    .load_contract(session.contract_id)
                    .await?
                    .ok_or_else(|| ForgeError::Persistence(format!("contract {} is missing", session.contract_id)))?;
                self.registry.insert(loaded)?
            }
        };
        let shared = self.collaborators.sandboxes.create(&format!("{id}-shared"))?;
        let handle = Arc::new(SessionHandle {
            session: Arc::new(RwLock::new(session)),
            contract: RwLock::new(contract),
            table: Arc::new(ComponentTable::default()),
            workspace: Arc::new(SharedWorkspace::new(shared)),
            attempts: Arc::new(AttemptLog::new()),
            audit: Arc::new(AuditLog::new()),
            broadcast: Arc::new(BroadcastLog::new()),
            cancel: Mutex::new(CancellationToken::new()),
            task: tokio::sync::Mutex::new(None),
        });
        tracing::info!(session = %id, "session restored from store");
        self.sessions.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Generation attempts of a session
    ///
    /// # Errors
    /// [`ForgeError::SessionNotFound`]
    pub fn attempts(&self, id: SessionId) -> ForgeResult<Vec<GenerationAttempt>> {
        Ok(self.handle(id)?.attempts.all())
    }

    /// Components of a session
    ///
    /// # Errors
    /// [`ForgeError::SessionNotFound`]
    pub fn components(&self, id: SessionId) -> ForgeResult<Vec<Component>> {
        Ok(self.handle(id)?.table.all())
    }

    /// Merged workspace head
    ///
    /// # Errors
    /// [`ForgeError::SessionNotFound`]
    pub fn snapshot(&self, id: SessionId) -> ForgeResult<Snapshot> {
        Ok(self.handle(id)?.workspace.snapshot())
    }

    /// Audit trail of a session
    ///
    /// # Errors
    /// [`ForgeError::SessionNotFound`]
    pub fn audit(&self, id: SessionId) -> ForgeResult<Vec<AuditEntry>> {
        Ok(self.handle(id)?.audit.entries())
    }

    /// Contract in force for a session
    ///
    /// # Errors
    /// [`ForgeError::SessionNotFound`]
    pub fn contract(&self, id: SessionId) -> ForgeResult<Arc<IntentContract>> {
        Ok(Arc::clone(&self.handle(id)?.contract.read()))
    }

    /// Shared known-fix library
    #[must_use]
    pub fn known_fixes(&self) -> &Arc<KnownFixLibrary> {
        &self.known_fixes
    }

    /// Every registered contract
    #[must_use]
    pub fn registry(&self) -> &Arc<ContractRegistry> {
        &self.registry
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }
}
