//! Phase driver
//!
//! One driver runs one session through the phase machine. It is the only
//! place that decides what a failure turns into: a rebuild round, an
//! escalation step, a backward phase loop, a pause for human input or an
//! abort. Subordinates report errors; they never swallow them.
//!
//! ```text
//! INTENT_LOCK -> INIT -> PARALLEL_BUILD -> INTEGRATION -> FUNCTIONAL_TEST
//!     -> INTENT_SATISFACTION -> VERIFICATION -> DEMO -> [DEPLOY]
//!     -> LEARNING_CAPTURE -> TERMINAL
//! ```

use crate::broadcast::DiscoveryKind;
use crate::component::ComponentTable;
use crate::config::ForgeConfig;
use crate::contract::IntentContract;
use crate::coordinator::{BuildCoordinator, BuildRequest, BuildResources};
use crate::error::{ForgeError, ForgeResult, PartitionError};
use crate::escalation::{
    EscalationLadder, EscalationLevel, EscalationOutcome, EscalationStep, ErrorSignature, Failure,
    FailureSource, KnownFixLibrary,
};
use crate::events::{format_duration, BuildSummary, EventKind};
use crate::functional::FunctionalTests;
use crate::gate::SatisfactionGate;
use crate::integration::IntegrationCheck;
use crate::partition::{promote_shared, PartitionPlan, Partitioner};
use crate::persistence::Persistence;
use crate::ports::{ArchitecturePlanner, CredentialStore, DeployTarget, GenerationMode};
use crate::session::{BuildSession, DemoReport};
use crate::swarm::{CheckContext, Finding, Severity, SwarmMode};
use crate::types::{ComponentId, EscalationId, SessionId};
use forge_artifact::{ChangeSet, Snapshot, WorkspacePath};
use forge_kernel::{classify, ComponentStatus, Phase, SessionStatus};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MAX_DIAGNOSTICS: usize = 20;
const DEMO_EXCERPT_LINES: usize = 10;

/// Everything a driver needs besides the session itself
#[derive(Clone)]
pub struct SessionServices {
    /// Architecture planning for INIT
    pub planner: Arc<dyn ArchitecturePlanner>,
    /// Secrets checked at INIT
    pub credentials: Arc<dyn CredentialStore>,
    /// Optional DEPLOY target
    pub deploy: Option<Arc<dyn DeployTarget>>,
    /// Session, contract and record storage
    pub persistence: Arc<dyn Persistence>,
    /// Level 0 fixes, shared across sessions
    pub known_fixes: Arc<KnownFixLibrary>,
    /// Coordinator resources
    pub build: BuildResources,
}

/// What a phase handler asks the loop to do next
#[derive(Debug)]
enum Next {
    Goto(Phase),
    Stay,
    Pause { reason: String, findings: Vec<Finding> },
    Abort(String),
    Complete,
}

/// A fix in flight, kept so LEARNING_CAPTURE can turn it into a known fix
#[derive(Debug)]
struct Lesson {
    signature: ErrorSignature,
    level: EscalationLevel,
    paths: BTreeSet<WorkspacePath>,
    before: Snapshot,
    after: Option<Snapshot>,
}

/// Runs one session to a terminal or paused state
pub struct PhaseDriver {
    session_id: SessionId,
    session: Arc<RwLock<BuildSession>>,
    contract: Arc<IntentContract>,
    config: ForgeConfig,
    services: SessionServices,
    coordinator: BuildCoordinator,
    table: Arc<ComponentTable>,
    plan: Option<PartitionPlan>,
    ladder: EscalationLadder,
    persisted: HashMap<EscalationId, EscalationOutcome>,
    queue: Vec<BuildRequest>,
    cancel: CancellationToken,
    open_fix: Option<Lesson>,
    lessons: Vec<Lesson>,
    verification_score: Option<f64>,
}

impl std::fmt::Debug for PhaseDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseDriver")
            .field("session_id", &self.session_id)
            .field("phase", &self.session.read().current_phase)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl PhaseDriver {
    /// Driver for `session`; a restored escalation level becomes the
    /// ladder floor
    #[must_use]
    pub fn new(
        session: Arc<RwLock<BuildSession>>,
        contract: Arc<IntentContract>,
        config: ForgeConfig,
        services: SessionServices,
        table: Arc<ComponentTable>,
        cancel: CancellationToken,
    ) -> Self {
        let (session_id, floor) = {
            let s = session.read();
            (s.id, s.escalation_level)
        };
        let coordinator = BuildCoordinator::new(
            session_id,
            Arc::clone(&contract),
            config.build.clone(),
            services.build.clone(),
        );
        let mut ladder = EscalationLadder::new(session_id, config.escalation.clone());
        if let Some(floor) = floor {
            ladder = ladder.with_floor(floor);
        }
        Self {
            session_id,
            session,
            contract,
            config,
            services,
            coordinator,
            table,
            plan: None,
            ladder,
            persisted: HashMap::new(),
            queue: Vec::new(),
            cancel,
            open_fix: None,
            lessons: Vec::new(),
            verification_score: None,
        }
    }

    /// Drive until the session completes, aborts or pauses
    pub async fn run(mut self) -> BuildSession {
        tracing::info!(session = %self.session_id, contract = %self.contract.id(), "phase driver started");
        loop {
            {
                let session = self.session.read();
                if session.is_terminal() || session.is_paused() {
                    break;
                }
            }
            let next = match self.step().await {
                Ok(next) => next,
                Err(err) => self.on_error(err).await,
            };
            if let Err(err) = self.apply(next) {
                tracing::error!(session = %self.session_id, error = %err, "phase driver failed to advance");
                if let Err(abort) = self.abort(&err.to_string()) {
                    tracing::error!(session = %self.session_id, error = %abort, "could not abort session");
                    break;
                }
            }
            self.persist().await;
        }
        let session = self.session.read().clone();
        tracing::info!(
            session = %self.session_id,
            status = ?session.status,
            phase = %session.current_phase,
            "phase driver stopped"
        );
        session
    }

    async fn step(&mut self) -> ForgeResult<Next> {
        if self.cancel.is_cancelled() {
            return Err(ForgeError::AbortRequested);
        }
        self.services.build.budget.note_step()?;
        self.services.build.budget.check()?;

        let phase = self.session.read().current_phase;
        tracing::debug!(session = %self.session_id, %phase, "driver step");
        match phase {
            Phase::IntentLock => self.intent_lock().await,
            Phase::Init => self.init().await,
            Phase::ParallelBuild => self.parallel_build().await,
            Phase::Integration => self.integration().await,
            Phase::FunctionalTest => self.functional_test().await,
            Phase::IntentSatisfaction => self.intent_satisfaction().await,
            Phase::Verification => self.verification().await,
            Phase::Demo => self.demo().await,
            Phase::Deploy => self.deploy().await,
            Phase::LearningCapture => Ok(self.learning_capture()),
            Phase::Terminal => Ok(Next::Complete),
        }
    }

    async fn on_error(&mut self, err: ForgeError) -> Next {
        if let ForgeError::BudgetExhausted(budget) = &err {
            self.emit(EventKind::BudgetExceeded { budget: *budget });
        }
        if err.is_abort() {
            return Next::Abort(err.to_string());
        }
        if err.requires_human() {
            tracing::warn!(session = %self.session_id, error = %err, "session needs input");
            let finding = Finding::blocking(Severity::High, err.to_string()).with_tag("needs-input");
            return Next::Pause {
                reason: err.to_string(),
                findings: vec![finding],
            };
        }
        if err.is_retryable() {
            let source = match self.session.read().current_phase {
                Phase::Integration => FailureSource::Integration,
                Phase::FunctionalTest => FailureSource::FunctionalTest,
                Phase::Verification => FailureSource::Verification,
                _ => FailureSource::Build,
            };
            let failure =
                Failure::new(source, &error_key(&err), err.to_string()).with_paths(err.conflict_paths());
            return match self.escalate(failure).await {
                Ok(next) => next,
                Err(err) => Next::Abort(err.to_string()),
            };
        }
        tracing::error!(session = %self.session_id, error = %err, "unrecoverable error");
        Next::Abort(err.to_string())
    }

    fn apply(&mut self, next: Next) -> ForgeResult<()> {
        match next {
            Next::Stay => Ok(()),
            Next::Goto(phase) => self.goto(phase),
            Next::Pause { reason, findings } => {
                let count = findings.len();
                self.session.write().pause(reason.clone(), findings)?;
                tracing::warn!(session = %self.session_id, %reason, findings = count, "session paused");
                self.emit(EventKind::StatusChanged {
                    status: SessionStatus::PausedNeedsInput,
                });
                self.emit(EventKind::Paused { reason, findings: count });
                Ok(())
            }
            Next::Abort(reason) => self.abort(&reason),
            Next::Complete => {
                if !self.session.read().current_phase.is_terminal() {
                    self.goto(Phase::Terminal)?;
                }
                self.set_status(SessionStatus::Building)?;
                let summary = self.summary();
                self.session.write().complete(summary.clone())?;
                tracing::info!(
                    session = %self.session_id,
                    merged = summary.components_merged,
                    cost = summary.cost_usd,
                    duration = %summary.duration_human,
                    "session completed"
                );
                self.emit(EventKind::StatusChanged {
                    status: SessionStatus::Completed,
                });
                self.emit(EventKind::Completed(summary));
                Ok(())
            }
        }
    }

    fn goto(&mut self, to: Phase) -> ForgeResult<()> {
        let from = self.session.read().current_phase;
        let kind = self.session.write().transition_to(to)?;
        self.services.build.audit.append(
            self.session_id.to_string(),
            "driver",
            format!("{from} -> {to}"),
            format!("{kind:?}"),
        );
        self.emit(EventKind::PhaseTransition { from, to, kind });
        Ok(())
    }

    fn abort(&mut self, reason: &str) -> ForgeResult<()> {
        let from = self.session.read().current_phase;
        self.session.write().abort(reason)?;
        self.cancel.cancel();
        tracing::warn!(session = %self.session_id, %reason, "session aborted");
        if from != Phase::Terminal {
            self.emit(EventKind::PhaseTransition {
                from,
                to: Phase::Terminal,
                kind: forge_kernel::TransitionKind::Abort,
            });
        }
        self.emit(EventKind::StatusChanged {
            status: SessionStatus::Aborted,
        });
        self.emit(EventKind::Failed {
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn set_status(&self, status: SessionStatus) -> ForgeResult<()> {
        let changed = {
            let mut session = self.session.write();
            let before = session.status;
            session.set_status(status)?;
            before != status
        };
        if changed {
            self.emit(EventKind::StatusChanged { status });
        }
        Ok(())
    }

    fn emit(&self, kind: EventKind) {
        self.services.build.progress.emit(self.session_id, kind);
    }

    async fn persist(&self) {
        let session = self.session.read().clone();
        if let Err(err) = self.services.persistence.save_session(&session).await {
            tracing::warn!(session = %self.session_id, error = %err, "failed to persist session");
        }
    }

    async fn persist_escalations(&mut self) {
        let changed: Vec<_> = self
            .ladder
            .records()
            .iter()
            .filter(|r| self.persisted.get(&r.id) != Some(&r.outcome))
            .cloned()
            .collect();
        for record in changed {
            match self.services.persistence.append_escalation(&record).await {
                Ok(()) => {
                    self.persisted.insert(record.id, record.outcome);
                }
                Err(err) => {
                    tracing::warn!(session = %self.session_id, error = %err, "failed to persist escalation record");
                }
            }
        }
    }

    // ---- phases -------------------------------------------------------

    async fn intent_lock(&mut self) -> ForgeResult<Next> {
        if !self.contract.is_locked() {
            return Err(ForgeError::ContractGeneration {
                reason: format!("contract {} must be locked before building", self.contract.id()),
                ambiguity: 0.0,
                questions: Vec::new(),
            });
        }
        if let Err(err) = self.services.persistence.save_contract(&self.contract).await {
            tracing::warn!(session = %self.session_id, error = %err, "failed to persist contract");
        }
        Ok(Next::Goto(Phase::Init))
    }

    async fn init(&mut self) -> ForgeResult<Next> {
        for name in &self.config.phases.required_secrets {
            if self.services.credentials.get_secret(name).await?.is_none() {
                return Err(ForgeError::SecretNotFound(name.clone()));
            }
        }

        let proposal = self.services.planner.plan(&self.contract).await?;
        let partitioner = Partitioner;
        let plan = match partitioner.partition(self.session_id, &self.contract, &proposal) {
            Err(PartitionError::Cycle { members }) => match promote_shared(&proposal, &members) {
                Some(promoted) => partitioner.partition(self.session_id, &self.contract, &promoted)?,
                None => return Err(PartitionError::Cycle { members }.into()),
            },
            other => other?,
        };

        self.adopt_partition(&plan).await?;
        self.emit(EventKind::ComponentsPartitioned {
            count: plan.components.len(),
        });
        self.services
            .build
            .broadcast
            .publish(DiscoveryKind::Contract, "engine", self.contract.to_string());
        self.services.build.audit.append(
            self.session_id.to_string(),
            "driver",
            "partition",
            format!("{} component(s), {} level(s)", plan.components.len(), plan.levels.len()),
        );

        self.queue = plan
            .merge_order
            .iter()
            .map(|id| BuildRequest::new(*id, GenerationMode::Build))
            .collect();
        self.plan = Some(plan);
        Ok(Next::Goto(Phase::ParallelBuild))
    }

    /// Swap in a new partition: files no new component owns under the same
    /// name are deleted, old claims released, new claims registered
    async fn adopt_partition(&mut self, plan: &PartitionPlan) -> ForgeResult<()> {
        let workspace = Arc::clone(&self.services.build.workspace);
        let previous = self.table.replace(plan.components.clone());

        let snapshot = workspace.snapshot();
        let keep: BTreeMap<&WorkspacePath, &str> = plan
            .components
            .iter()
            .flat_map(|c| c.owned_files.iter().map(move |p| (p, c.name.as_str())))
            .collect();
        let mut stale: BTreeMap<String, ChangeSet> = BTreeMap::new();
        for path in snapshot.paths() {
            let owner = snapshot.owner_of(path).unwrap_or_default();
            if keep.get(path).copied() != Some(owner) {
                stale
                    .entry(owner.to_string())
                    .or_insert_with(|| ChangeSet::new(owner))
                    .delete(path.clone());
            }
        }
        if !stale.is_empty() {
            for (owner, set) in &stale {
                workspace.register_claims(owner, set.paths())?;
            }
            let sets: Vec<ChangeSet> = stale.values().cloned().collect();
            let receipt = workspace.merge(&sets, "remove files left by the previous partition", &self.cancel).await?;
            tracing::info!(session = %self.session_id, removed = receipt.paths.len(), "stale files removed");
        }

        for component in &previous {
            workspace.release_claims(&component.name);
        }
        for owner in stale.keys() {
            workspace.release_claims(owner);
        }
        for component in &plan.components {
            workspace.register_claims(&component.name, &component.owned_files)?;
        }
        Ok(())
    }

    async fn parallel_build(&mut self) -> ForgeResult<Next> {
        let mut requests = std::mem::take(&mut self.queue);
        if requests.is_empty() {
            requests = self
                .table
                .all()
                .into_iter()
                .filter(|c| !c.is_merged())
                .map(|c| BuildRequest::new(c.id, GenerationMode::Build))
                .collect();
        }
        if requests.is_empty() {
            self.resolve(Some(FailureSource::Build)).await?;
            return Ok(Next::Goto(Phase::Integration));
        }

        let Some(plan) = self.plan.as_ref() else {
            return Err(ForgeError::Config("no partition to build".into()));
        };
        let submitted: BTreeMap<ComponentId, BuildRequest> =
            requests.iter().map(|r| (r.component, r.clone())).collect();
        let report = self
            .coordinator
            .build_round(&self.table, plan, requests, &self.cancel)
            .await?;
        tracing::info!(
            session = %self.session_id,
            merged = report.merged.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            "build round finished"
        );

        let unmerged: Vec<ComponentId> = self
            .table
            .all()
            .into_iter()
            .filter(|c| !c.is_merged())
            .map(|c| c.id)
            .collect();
        if report.failed.is_empty() {
            if unmerged.is_empty() {
                self.resolve(Some(FailureSource::Build)).await?;
                return Ok(Next::Goto(Phase::Integration));
            }
            // Blocked behind a dependency that was not requested
            self.queue = unmerged
                .into_iter()
                .map(|id| submitted.get(&id).cloned().unwrap_or_else(|| BuildRequest::new(id, GenerationMode::Build)))
                .collect();
            return Ok(Next::Stay);
        }

        let (first_id, first_err) = &report.failed[0];
        let key = error_key(first_err);
        let names: Vec<String> = report
            .failed
            .iter()
            .filter_map(|(id, _)| self.table.get(*id).map(|c| c.name))
            .collect();
        let findings: Vec<Finding> = report
            .failed
            .iter()
            .map(|(id, err)| {
                let mut finding = Finding::blocking(Severity::High, err.to_string()).with_tag(error_key(err));
                if let Some(path) = err.conflict_paths().first() {
                    finding = finding.at(path);
                } else if let Some(c) = self.table.get(*id) {
                    finding.message = format!("{}: {}", c.name, finding.message);
                }
                finding
            })
            .collect();
        let failure = Failure::new(
            FailureSource::Build,
            &key,
            format!("build failed for {}: {first_err}", names.join(", ")),
        )
        .with_components(report.failed.iter().map(|(id, _)| *id))
        .with_paths(report.failed.iter().flat_map(|(_, err)| err.conflict_paths()))
        .with_findings(findings);
        tracing::warn!(session = %self.session_id, component = %first_id, signature = %failure.signature, "build round failed");

        let next = self.escalate(failure).await?;
        let queued: BTreeSet<ComponentId> = self.queue.iter().map(|r| r.component).collect();
        for id in &report.blocked {
            if !queued.contains(id) {
                self.queue.push(
                    submitted
                        .get(id)
                        .cloned()
                        .unwrap_or_else(|| BuildRequest::new(*id, GenerationMode::Build)),
                );
            }
        }
        Ok(next)
    }

    async fn integration(&mut self) -> ForgeResult<Next> {
        let snapshot = self.services.build.workspace.snapshot();
        let components = self.table.all();
        let report = IntegrationCheck.run(&snapshot, &components);
        if report.passed() {
            self.resolve(Some(FailureSource::Integration)).await?;
            return Ok(Next::Goto(Phase::FunctionalTest));
        }

        let key = report.tags().join("+");
        let unmerged = components.iter().filter(|c| !c.is_merged()).map(|c| c.id);
        let failure = Failure::new(
            FailureSource::Integration,
            &key,
            format!("{} integration finding(s): {key}", report.findings.len()),
        )
        .with_components(unmerged)
        .with_findings(report.findings);
        self.escalate(failure).await
    }

    async fn functional_test(&mut self) -> ForgeResult<Next> {
        let snapshot = self.services.build.workspace.snapshot();
        let sandbox = self.services.build.workspace.sandbox();
        let tests = FunctionalTests::new(self.config.phases.functional_commands.clone());
        let report = tests.run(&sandbox, &snapshot, &self.table.all()).await?;
        if report.passed() {
            self.resolve(Some(FailureSource::FunctionalTest)).await?;
            return Ok(Next::Goto(Phase::IntentSatisfaction));
        }

        let failing: Vec<_> = report.failures().collect();
        let key = failing.iter().map(|r| r.command.as_str()).collect::<Vec<_>>().join("+");
        let findings: Vec<Finding> = failing
            .iter()
            .map(|run| {
                let first = run.output.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
                let exit = run
                    .exit_code
                    .map_or_else(|| "could not run".to_string(), |code| format!("exited {code}"));
                Finding::blocking(Severity::High, format!("`{}` {exit}: {first}", run.command))
                    .with_tag("functional-failure")
            })
            .collect();
        let failure = Failure::new(
            FailureSource::FunctionalTest,
            &key,
            format!("{} functional command(s) failed", failing.len()),
        )
        .with_paths(report.paths.iter().cloned())
        .with_components(report.affected.iter().copied())
        .with_findings(findings);
        self.escalate(failure).await
    }

    async fn intent_satisfaction(&mut self) -> ForgeResult<Next> {
        let snapshot = self.services.build.workspace.snapshot();
        let sandbox = self.services.build.workspace.sandbox();
        let components = self.table.all();
        let report = SatisfactionGate
            .evaluate(&self.contract, &snapshot, &sandbox, &components)
            .await;
        self.emit(EventKind::GateEvaluated {
            satisfied: report.satisfied.len(),
            unsatisfied: report.unsatisfied_ids(),
        });
        if report.is_satisfied() {
            return Ok(Next::Goto(Phase::Verification));
        }

        let round = self.services.build.budget.note_satisfaction_round()?;
        let mut requests: BTreeMap<ComponentId, BuildRequest> = BTreeMap::new();
        for gap in &report.unsatisfied {
            for id in &gap.responsible {
                let Some(component) = components.iter().find(|c| c.id == *id) else { continue };
                let request = requests
                    .entry(*id)
                    .or_insert_with(|| BuildRequest::new(*id, GenerationMode::GapFix));
                request
                    .target_files
                    .extend(gap.paths.intersection(&component.owned_files).cloned());
                request.diagnostics.push(format!("{} unmet: {}", gap.criterion, gap.detail));
            }
        }
        tracing::info!(
            session = %self.session_id,
            round,
            gaps = report.unsatisfied.len(),
            components = requests.len(),
            "closing contract gaps"
        );
        self.queue = requests.into_values().collect();
        Ok(Next::Goto(Phase::ParallelBuild))
    }

    async fn verification(&mut self) -> ForgeResult<Next> {
        let snapshot = self.services.build.workspace.snapshot();
        let ctx = CheckContext::new(snapshot, Arc::clone(&self.contract))
            .with_sandbox(self.services.build.workspace.sandbox());
        let report = self.services.build.swarm.run(ctx, SwarmMode::Authoritative).await;
        self.services.build.progress.emit_report(self.session_id, &report);
        for result in &report.results {
            if let Err(err) = self.services.persistence.append_verification(self.session_id, result).await {
                tracing::warn!(session = %self.session_id, error = %err, "failed to persist verification result");
            }
        }
        self.verification_score = report.composite_score();

        if report.satisfied {
            self.resolve(None).await?;
            return Ok(Next::Goto(Phase::Demo));
        }

        let failed: Vec<_> = report.failures().collect();
        let key = failed
            .iter()
            .map(|r| {
                let tag = r
                    .blocking_findings()
                    .chain(r.findings.iter())
                    .find_map(|f| f.tag.clone())
                    .unwrap_or_else(|| "below-threshold".to_string());
                format!("{}/{tag}", r.checker)
            })
            .collect::<Vec<_>>()
            .join("+");
        let names: Vec<&str> = failed.iter().map(|r| r.checker.as_str()).collect();
        let findings: Vec<Finding> = failed.iter().flat_map(|r| r.findings.iter().cloned()).collect();
        let failure = Failure::new(
            FailureSource::Verification,
            &key,
            format!("{} checker(s) failed: {}", failed.len(), names.join(", ")),
        )
        .with_findings(findings);
        self.escalate(failure).await
    }

    async fn demo(&mut self) -> ForgeResult<Next> {
        let snapshot = self.services.build.workspace.snapshot();
        let report = match &self.config.phases.demo_command {
            Some(command) => match self.services.build.workspace.sandbox().exec(command).await {
                Ok(out) => {
                    if !out.success() {
                        tracing::warn!(session = %self.session_id, %command, exit_code = out.exit_code, "demo command failed");
                    }
                    DemoReport {
                        command: Some(command.clone()),
                        exit_code: Some(out.exit_code),
                        excerpt: out.stdout.lines().take(DEMO_EXCERPT_LINES).collect::<Vec<_>>().join("\n"),
                        files: snapshot.len(),
                    }
                }
                Err(err) if err.is_abort() => return Err(err),
                Err(err) => DemoReport {
                    command: Some(command.clone()),
                    exit_code: None,
                    excerpt: err.to_string(),
                    files: snapshot.len(),
                },
            },
            None => DemoReport {
                command: None,
                exit_code: None,
                excerpt: String::new(),
                files: snapshot.len(),
            },
        };
        self.session.write().demo = Some(report);

        if self.config.phases.deploy_enabled && self.services.deploy.is_some() {
            Ok(Next::Goto(Phase::Deploy))
        } else {
            Ok(Next::Goto(Phase::LearningCapture))
        }
    }

    async fn deploy(&mut self) -> ForgeResult<Next> {
        let Some(target) = self.services.deploy.clone() else {
            return Ok(Next::Goto(Phase::LearningCapture));
        };
        let snapshot = self.services.build.workspace.snapshot();
        match target.deploy(self.session_id, &snapshot).await {
            Ok(receipt) => {
                tracing::info!(session = %self.session_id, url = %receipt.url, revision = %receipt.revision, "deployed");
                self.services.build.audit.append(
                    self.session_id.to_string(),
                    "driver",
                    "deploy",
                    receipt.url.clone(),
                );
                self.session.write().deploy = Some(receipt);
                Ok(Next::Goto(Phase::LearningCapture))
            }
            Err(err) if err.is_abort() => Err(err),
            Err(err) => Ok(Next::Pause {
                reason: err.to_string(),
                findings: vec![Finding::blocking(Severity::High, err.to_string()).with_tag("deploy-failed")],
            }),
        }
    }

    fn learning_capture(&mut self) -> Next {
        let mut learned = 0usize;
        for lesson in self.lessons.drain(..) {
            let Some(after) = &lesson.after else { continue };
            let paths: BTreeSet<WorkspacePath> = if lesson.paths.is_empty() {
                lesson.before.paths().chain(after.paths()).cloned().collect()
            } else {
                lesson.paths.clone()
            };
            if self
                .services
                .known_fixes
                .learn_from(&lesson.signature, &paths, &lesson.before, after)
                .is_some()
            {
                learned += 1;
                self.services.build.broadcast.publish(
                    DiscoveryKind::ResolvedError,
                    "engine",
                    format!("{} resolved at {}", lesson.signature, lesson.level),
                );
                self.services.build.audit.append(
                    self.session_id.to_string(),
                    "driver",
                    "learn",
                    lesson.signature.to_string(),
                );
            }
        }
        tracing::info!(session = %self.session_id, learned, "learning captured");
        Next::Complete
    }

    // ---- escalation ---------------------------------------------------

    /// Turn a failure into the next remediation step
    async fn escalate(&mut self, mut failure: Failure) -> ForgeResult<Next> {
        loop {
            self.set_status(SessionStatus::Escalating)?;
            let has_fix = self.services.known_fixes.lookup(&failure.signature).is_some();
            let step = match self.ladder.next_step(failure.clone(), has_fix) {
                Ok(step) => step,
                Err(err @ ForgeError::EscalationExhausted { .. }) => {
                    self.persist_escalations().await;
                    let mut findings = failure.findings;
                    if findings.is_empty() {
                        findings.push(Finding::blocking(Severity::High, failure.summary).with_tag("unresolved"));
                    }
                    return Ok(Next::Pause {
                        reason: err.to_string(),
                        findings,
                    });
                }
                Err(err) => return Err(err),
            };

            self.session.write().raise_escalation(step.level);
            self.emit(EventKind::Escalation {
                level: step.level,
                signature: step.failure.signature.to_string(),
                attempt: step.attempt,
            });
            self.persist_escalations().await;
            self.open_fix = Some(Lesson {
                signature: step.failure.signature.clone(),
                level: step.level,
                paths: step.failure.paths.clone(),
                before: self.services.build.workspace.snapshot(),
                after: None,
            });

            if step.level == EscalationLevel::KnownPattern {
                match self.apply_known_fix(&step).await {
                    Ok(true) => return Ok(self.after_known_fix()),
                    Ok(false) => {}
                    Err(err) if err.is_abort() => return Err(err),
                    Err(err) => {
                        tracing::warn!(session = %self.session_id, error = %err, "known fix could not be merged");
                    }
                }
                // Same signature again: the ladder records the failed fix and climbs
                failure = step.failure;
                continue;
            }

            self.queue_remediation(&step);
            let phase = self.session.read().current_phase;
            return Ok(if phase == Phase::ParallelBuild {
                Next::Stay
            } else {
                Next::Goto(Phase::ParallelBuild)
            });
        }
    }

    async fn apply_known_fix(&self, step: &EscalationStep) -> ForgeResult<bool> {
        let workspace = &self.services.build.workspace;
        let snapshot = workspace.snapshot();
        let Some(files) = self
            .services
            .known_fixes
            .apply(&step.failure.signature, &snapshot, &step.failure.paths)
        else {
            return Ok(false);
        };

        let mut sets: BTreeMap<String, ChangeSet> = BTreeMap::new();
        for (path, bytes) in files {
            let owner = snapshot
                .owner_of(&path)
                .map(str::to_string)
                .or_else(|| workspace.owner_of(&path));
            let Some(owner) = owner else {
                tracing::warn!(session = %self.session_id, %path, "known fix touches an unowned path");
                return Ok(false);
            };
            sets.entry(owner.clone())
                .or_insert_with(|| ChangeSet::new(owner))
                .write(path, bytes);
        }
        let sets: Vec<ChangeSet> = sets.into_values().collect();
        let receipt = workspace
            .merge(&sets, &format!("known fix for {}", step.failure.signature), &self.cancel)
            .await?;
        tracing::info!(
            session = %self.session_id,
            signature = %step.failure.signature,
            revision = %receipt.revision,
            files = receipt.paths.len(),
            "known fix applied"
        );
        self.services.build.audit.append(
            self.session_id.to_string(),
            "driver",
            format!("known fix {}", step.failure.signature),
            receipt.revision.to_string(),
        );
        Ok(true)
    }

    /// Re-check from INTEGRATION after a templated fix
    fn after_known_fix(&self) -> Next {
        let phase = self.session.read().current_phase;
        if phase == Phase::Integration {
            Next::Stay
        } else if classify(phase, Phase::Integration).is_some() {
            Next::Goto(Phase::Integration)
        } else {
            Next::Goto(Phase::ParallelBuild)
        }
    }

    fn queue_remediation(&mut self, step: &EscalationStep) {
        let components = self.table.all();
        let mut affected: BTreeSet<ComponentId> = step.failure.components.clone();
        affected.extend(step.failure.paths.iter().filter_map(|p| self.table.owner_of(p)));
        if affected.is_empty() {
            affected = components.iter().map(|c| c.id).collect();
        }

        let mode = match step.level {
            EscalationLevel::KnownPattern | EscalationLevel::LocalFix => GenerationMode::LocalFix,
            EscalationLevel::ComponentFix => GenerationMode::ComponentFix,
            EscalationLevel::ComponentRewrite => GenerationMode::ComponentRewrite,
            EscalationLevel::FeatureRewrite => GenerationMode::FeatureRewrite,
        };
        if mode == GenerationMode::FeatureRewrite {
            let features: BTreeSet<Option<&str>> = components
                .iter()
                .filter(|c| affected.contains(&c.id))
                .map(|c| c.feature.as_deref())
                .collect();
            // Components without a feature belong to the whole application
            affected = if features.contains(&None) {
                components.iter().map(|c| c.id).collect()
            } else {
                components
                    .iter()
                    .filter(|c| features.contains(&c.feature.as_deref()))
                    .map(|c| c.id)
                    .collect()
            };
        }

        let mut diagnostics = vec![step.failure.summary.clone()];
        diagnostics.extend(step.failure.findings.iter().take(MAX_DIAGNOSTICS).map(ToString::to_string));

        self.queue = components
            .iter()
            .filter(|c| affected.contains(&c.id))
            .map(|c| {
                let mut request = BuildRequest::new(c.id, mode).with_diagnostics(diagnostics.clone());
                if mode == GenerationMode::LocalFix {
                    request = request.with_targets(step.failure.paths.intersection(&c.owned_files).cloned());
                }
                request
            })
            .collect();
        tracing::info!(
            session = %self.session_id,
            level = %step.level,
            %mode,
            components = self.queue.len(),
            "remediation queued"
        );
    }

    /// Close the pending step if it came from `source` (any source when
    /// `None`), and return to `Building` once nothing is pending
    async fn resolve(&mut self, source: Option<FailureSource>) -> ForgeResult<()> {
        let pending = self.ladder.pending_source();
        if pending.is_some() && (source.is_none() || pending == source) {
            if let Some(record) = self.ladder.record_outcome(true) {
                tracing::info!(
                    session = %self.session_id,
                    level = %record.level,
                    signature = %record.signature,
                    "escalation resolved"
                );
            }
            self.persist_escalations().await;
            if let Some(mut lesson) = self.open_fix.take() {
                if lesson.level > EscalationLevel::KnownPattern {
                    lesson.after = Some(self.services.build.workspace.snapshot());
                    self.lessons.push(lesson);
                }
            }
        }
        if self.ladder.pending().is_none() {
            self.set_status(SessionStatus::Building)?;
        }
        Ok(())
    }

    fn summary(&self) -> BuildSummary {
        let components = self.table.all();
        let budget = &self.services.build.budget;
        let elapsed = budget.elapsed();
        BuildSummary {
            components_merged: components.iter().filter(|c| c.is_merged()).count(),
            components_failed: components
                .iter()
                .filter(|c| c.status == ComponentStatus::Failed)
                .count(),
            verification_score: self.verification_score,
            cost_usd: budget.cost_usd(),
            generation_calls: budget.generation_calls(),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            duration_human: format_duration(elapsed),
        }
    }
}

/// Stable signature key for an error; messages carry ids and timings that
/// would split one defect into many signatures
fn error_key(err: &ForgeError) -> String {
    match err {
        ForgeError::FileConflict { .. } => "file-conflict".into(),
        ForgeError::GenerationTimeout { .. } => "generation-timeout".into(),
        ForgeError::Generation { .. } => "generation-failed".into(),
        ForgeError::Sandbox(_) => "sandbox-error".into(),
        ForgeError::CheckerCrash { checker, .. } => format!("{checker}/internal-error"),
        other => other.to_string(),
    }
}
