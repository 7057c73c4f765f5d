//! Parallel build coordinator
//!
//! Builds every requested component whose dependencies are merged, one DAG
//! level at a time. Components of a level build concurrently; each runs one
//! or more tournament candidates in separate sandboxes, and each candidate
//! runs one or more agents over disjoint slices of the component's files.
//! Total in-flight generation calls are bounded by a semaphore.
//!
//! Writes inside a candidate go through a per-path ledger, so two agents
//! writing different content to one path is a [`ForgeError::FileConflict`]
//! rather than last-writer-wins. Finished components merge into the shared
//! workspace in merge order; a rejected merge sends the component back to
//! `Building` with the offending paths flagged.

use crate::broadcast::{BroadcastLog, DiscoveryKind};
use crate::budget::BudgetTracker;
use crate::component::{AttemptLog, AttemptStatus, Component, ComponentTable, GenerationAttempt};
use crate::config::BuildConfig;
use crate::contract::IntentContract;
use crate::error::{ForgeError, ForgeResult};
use crate::events::{EventKind, ProgressChannel};
use crate::partition::PartitionPlan;
use crate::ports::{GenerationMode, GenerationService, PromptContext, SandboxFactory, WorkspaceSandbox};
use crate::swarm::{select_winner, CandidateScore, CheckContext, SwarmMode, VerificationSwarm};
use crate::types::{AgentId, AttemptId, ComponentId, SessionId};
use crate::workspace::SharedWorkspace;
use chrono::Utc;
use dashmap::DashMap;
use forge_artifact::{ChangeSet, ContentHash, Snapshot, WorkspacePath};
use forge_composition::{ConflictKind, PathConflict, PathWriteLedger};
use forge_kernel::{AuditLog, ComponentStatus};
use futures::future::{join_all, try_join_all};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// One component to (re)build this round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Component
    pub component: ComponentId,
    /// Why
    pub mode: GenerationMode,
    /// Files to produce; empty means every owned file
    pub target_files: BTreeSet<WorkspacePath>,
    /// Diagnostics passed to the generator
    pub diagnostics: Vec<String>,
}

impl BuildRequest {
    /// Request for every owned file
    #[must_use]
    pub fn new(component: ComponentId, mode: GenerationMode) -> Self {
        Self {
            component,
            mode,
            target_files: BTreeSet::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Restrict to `paths`
    #[must_use]
    pub fn with_targets(mut self, paths: impl IntoIterator<Item = WorkspacePath>) -> Self {
        self.target_files.extend(paths);
        self
    }

    /// Add diagnostics
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: impl IntoIterator<Item = String>) -> Self {
        self.diagnostics.extend(diagnostics);
        self
    }
}

/// Outcome of one build round
#[derive(Debug, Default)]
pub struct RoundReport {
    /// Components merged this round, in merge order
    pub merged: Vec<ComponentId>,
    /// Components that failed to build or merge
    pub failed: Vec<(ComponentId, ForgeError)>,
    /// Components skipped because a dependency is not merged
    pub blocked: Vec<ComponentId>,
}

impl RoundReport {
    /// Everything requested was merged
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

/// Shared services the coordinator draws on
#[derive(Clone)]
pub struct BuildResources {
    /// Code generation
    pub generator: Arc<dyn GenerationService>,
    /// Candidate sandboxes
    pub sandboxes: Arc<dyn SandboxFactory>,
    /// Checkers, for tournament scoring and advisory runs
    pub swarm: Arc<VerificationSwarm>,
    /// Merge target
    pub workspace: Arc<SharedWorkspace>,
    /// Agent context log
    pub broadcast: Arc<BroadcastLog>,
    /// Spend tracking
    pub budget: Arc<BudgetTracker>,
    /// Attempt trail
    pub attempts: Arc<AttemptLog>,
    /// Hash-chained audit
    pub audit: Arc<AuditLog>,
    /// Events
    pub progress: Arc<ProgressChannel>,
}

/// Drives generation and merging for one session
#[derive(Clone)]
pub struct BuildCoordinator {
    session_id: SessionId,
    contract: Arc<IntentContract>,
    config: BuildConfig,
    res: BuildResources,
    permits: Arc<Semaphore>,
    agents: Arc<DashMap<(ComponentId, usize, usize), AgentId>>,
}

impl fmt::Debug for BuildCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildCoordinator")
            .field("session_id", &self.session_id)
            .field("config", &self.config)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

/// One candidate's private file tree, guarded by a per-path ledger
struct ComponentWorkspace {
    owner: String,
    owned: BTreeSet<WorkspacePath>,
    ledger: PathWriteLedger,
    sandbox: Arc<dyn WorkspaceSandbox>,
    files: Mutex<BTreeMap<WorkspacePath, String>>,
}

impl ComponentWorkspace {
    fn new(component: &Component, sandbox: Arc<dyn WorkspaceSandbox>) -> Self {
        Self {
            owner: component.name.clone(),
            owned: component.owned_files.clone(),
            ledger: PathWriteLedger::new(component.name.clone()),
            sandbox,
            files: Mutex::new(BTreeMap::new()),
        }
    }

    async fn write(&self, path: &WorkspacePath, content: String, agent: &str) -> ForgeResult<ContentHash> {
        if !self.owned.contains(path) {
            return Err(ForgeError::FileConflict {
                component: self.owner.clone(),
                conflicts: vec![PathConflict {
                    path: path.clone(),
                    kind: ConflictKind::OutOfScope,
                    writer: format!("{}/{agent}", self.owner),
                    holder: None,
                }],
            });
        }
        let hash = ContentHash::compute(content.as_bytes());
        self.ledger
            .record(path, hash, agent)
            .map_err(|e| ForgeError::file_conflict(&self.owner, e))?;
        self.sandbox.write_file(path, content.as_bytes()).await?;
        self.files.lock().insert(path.clone(), content);
        Ok(hash)
    }

    fn into_files(self) -> BTreeMap<WorkspacePath, String> {
        self.files.into_inner()
    }
}

struct AgentJob<'a> {
    component: &'a Component,
    request: &'a BuildRequest,
    workspace: &'a ComponentWorkspace,
    base: &'a Snapshot,
    candidate: usize,
    index: usize,
    targets: Vec<WorkspacePath>,
}

impl BuildCoordinator {
    /// Coordinator for one session
    #[must_use]
    pub fn new(
        session_id: SessionId,
        contract: Arc<IntentContract>,
        config: BuildConfig,
        resources: BuildResources,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_parallelism.max(1)));
        Self {
            session_id,
            contract,
            config,
            res: resources,
            permits,
            agents: Arc::new(DashMap::new()),
        }
    }

    /// Swap the contract after an amendment
    #[must_use]
    pub fn with_contract(mut self, contract: Arc<IntentContract>) -> Self {
        self.contract = contract;
        self
    }

    /// Build and merge every requested component whose dependencies are
    /// merged
    ///
    /// Levels run in order, so a component requested together with its
    /// dependency builds after that dependency merged in the same round.
    ///
    /// # Errors
    /// [`ForgeError::AbortRequested`] and [`ForgeError::BudgetExhausted`];
    /// every other failure is reported per component in [`RoundReport`]
    pub async fn build_round(
        &self,
        table: &Arc<ComponentTable>,
        plan: &PartitionPlan,
        requests: Vec<BuildRequest>,
        cancel: &CancellationToken,
    ) -> ForgeResult<RoundReport> {
        let mut pending: BTreeMap<ComponentId, BuildRequest> =
            requests.into_iter().map(|r| (r.component, r)).collect();
        let mut report = RoundReport::default();

        for level in &plan.levels {
            if pending.is_empty() {
                break;
            }
            if cancel.is_cancelled() {
                return Err(ForgeError::AbortRequested);
            }

            let mut spawned = Vec::new();
            for id in level {
                let Some(request) = pending.remove(id) else { continue };
                let Some(component) = table.get(*id) else { continue };
                let ready = component
                    .depends_on
                    .iter()
                    .all(|dep| table.get(*dep).is_some_and(|c| c.is_merged()));
                if !ready {
                    tracing::debug!(component = %component.name, "dependencies not merged, skipping");
                    report.blocked.push(*id);
                    continue;
                }
                let component = self.set_status(table, *id, ComponentStatus::Building)?;
                let this = self.clone();
                let cancel = cancel.clone();
                spawned.push((
                    *id,
                    tokio::spawn(async move { this.build_component(component, request, &cancel).await }),
                ));
            }

            let (ids, handles): (Vec<_>, Vec<_>) = spawned.into_iter().unzip();
            let mut built: Vec<(ComponentId, ChangeSet)> = Vec::new();
            let mut abort: Option<ForgeError> = None;
            for (id, joined) in ids.into_iter().zip(join_all(handles).await) {
                let result = joined.unwrap_or_else(|join| {
                    Err(ForgeError::Generation {
                        component: id.to_string(),
                        message: format!("build task panicked: {join}"),
                    })
                });
                match result {
                    Ok(set) => {
                        self.set_status(table, id, ComponentStatus::Verifying)?;
                        built.push((id, set));
                    }
                    Err(err) if err.is_abort() => {
                        abort.get_or_insert(err);
                    }
                    Err(err) => {
                        self.reject(table, id, &err)?;
                        report.failed.push((id, err));
                    }
                }
            }
            if let Some(err) = abort {
                return Err(err);
            }

            built.sort_by_key(|(id, _)| plan.merge_rank(*id));
            for (id, set) in built {
                let name = set.owner().to_string();
                match self
                    .res
                    .workspace
                    .merge(std::slice::from_ref(&set), &format!("merge {name}"), cancel)
                    .await
                {
                    Ok(receipt) => {
                        table.update(id, |c| {
                            c.transition(ComponentStatus::Merged)?;
                            c.build_count += 1;
                            c.merged_revision = Some(receipt.revision);
                            c.flagged_paths.clear();
                            Ok(())
                        })?;
                        self.emit_status(table, id);
                        self.res
                            .progress
                            .emit(self.session_id, EventKind::ComponentCompleted { name: name.clone() });
                        self.res.broadcast.publish(
                            DiscoveryKind::SiblingProgress,
                            name.as_str(),
                            format!("merged at {} ({} files)", receipt.revision, receipt.paths.len()),
                        );
                        self.res.audit.append(
                            self.session_id.to_string(),
                            name.as_str(),
                            "merge",
                            receipt.revision.to_string(),
                        );
                        report.merged.push(id);
                    }
                    Err(err) if err.is_abort() => return Err(err),
                    Err(err) => {
                        self.reject(table, id, &err)?;
                        report.failed.push((id, err));
                    }
                }
            }
        }

        report.blocked.extend(pending.into_keys());
        Ok(report)
    }

    /// Put a failed component back in a rebuildable state
    fn reject(&self, table: &ComponentTable, id: ComponentId, err: &ForgeError) -> ForgeResult<()> {
        let name = table.update(id, |c| {
            match err {
                ForgeError::FileConflict { .. } => {
                    c.flagged_paths.extend(err.conflict_paths());
                    if c.status != ComponentStatus::Building {
                        c.transition(ComponentStatus::Building)?;
                    }
                }
                _ => c.transition(ComponentStatus::Failed)?,
            }
            Ok(c.name.clone())
        })?;
        tracing::warn!(component = %name, error = %err, "component rejected");
        self.emit_status(table, id);
        self.res.progress.emit(
            self.session_id,
            EventKind::ComponentFailed {
                name,
                reason: err.to_string(),
            },
        );
        Ok(())
    }

    fn set_status(&self, table: &ComponentTable, id: ComponentId, status: ComponentStatus) -> ForgeResult<Component> {
        let component = table.update(id, |c| {
            if status == ComponentStatus::Building {
                c.begin_build()?;
            } else {
                c.transition(status)?;
            }
            Ok(c.clone())
        })?;
        self.emit_status(table, id);
        Ok(component)
    }

    fn emit_status(&self, table: &ComponentTable, id: ComponentId) {
        if let Some(c) = table.get(id) {
            self.res.progress.emit(
                self.session_id,
                EventKind::ComponentStatus {
                    component: id,
                    name: c.name,
                    status: c.status,
                },
            );
        }
    }

    /// Run every candidate for one component and return the winner's changes
    async fn build_component(
        &self,
        component: Component,
        request: BuildRequest,
        cancel: &CancellationToken,
    ) -> ForgeResult<ChangeSet> {
        let targets: Vec<WorkspacePath> = if request.target_files.is_empty() {
            component.owned_files.iter().cloned().collect()
        } else {
            request
                .target_files
                .intersection(&component.owned_files)
                .cloned()
                .collect()
        };
        if targets.is_empty() {
            return Err(ForgeError::Generation {
                component: component.name.clone(),
                message: "no owned files to generate".into(),
            });
        }

        tracing::info!(
            component = %component.name,
            mode = %request.mode,
            files = targets.len(),
            "building component"
        );
        self.res.progress.emit(
            self.session_id,
            EventKind::ComponentStarted {
                name: component.name.clone(),
            },
        );
        self.res.broadcast.publish(
            DiscoveryKind::SiblingProgress,
            component.name.as_str(),
            format!("building ({})", request.mode),
        );

        let base = self.res.workspace.snapshot();
        let candidates = self.config.tournament_candidates.max(1);
        let runs = join_all(
            (0..candidates).map(|candidate| self.run_candidate(&component, &request, &targets, &base, candidate, cancel)),
        )
        .await;

        let mut outputs: Vec<(usize, ChangeSet)> = Vec::new();
        let mut first_error: Option<ForgeError> = None;
        for (candidate, run) in runs.into_iter().enumerate() {
            match run {
                Ok(files) => outputs.push((candidate, self.change_set(&component, request.mode, &base, files))),
                Err(err) if err.is_abort() => return Err(err),
                Err(err) => {
                    tracing::debug!(component = %component.name, candidate, error = %err, "candidate failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        if outputs.is_empty() {
            return Err(first_error.unwrap_or_else(|| ForgeError::Generation {
                component: component.name.clone(),
                message: "no candidate produced output".into(),
            }));
        }

        let winner = if outputs.len() == 1 {
            0
        } else {
            let scores: Vec<CandidateScore> = join_all(outputs.iter().map(|(_, set)| {
                let ctx = CheckContext::new(base.overlay(set), Arc::clone(&self.contract))
                    .with_scope(set.paths().cloned().collect());
                self.res.swarm.score_candidate(ctx)
            }))
            .await;
            let winner = select_winner(&scores).unwrap_or(0);
            tracing::info!(
                component = %component.name,
                winner = outputs[winner].0,
                score = scores[winner].score,
                "tournament decided"
            );
            winner
        };

        for (idx, (candidate, _)) in outputs.iter().enumerate() {
            if idx != winner {
                self.res
                    .attempts
                    .discard_candidate(component.id, *candidate, request.mode);
            }
        }
        let (_, set) = outputs.swap_remove(winner);

        if self.config.continuous_verification {
            let ctx = CheckContext::new(base.overlay(&set), Arc::clone(&self.contract))
                .with_scope(set.paths().cloned().collect());
            let report = self.res.swarm.run(ctx, SwarmMode::Advisory).await;
            self.res.progress.emit_report(self.session_id, &report);
        }
        Ok(set)
    }

    async fn run_candidate(
        &self,
        component: &Component,
        request: &BuildRequest,
        targets: &[WorkspacePath],
        base: &Snapshot,
        candidate: usize,
        cancel: &CancellationToken,
    ) -> ForgeResult<BTreeMap<WorkspacePath, String>> {
        let sandbox = self
            .res
            .sandboxes
            .create(&format!("{}-{}-c{candidate}", self.session_id, component.name))?;
        let workspace = ComponentWorkspace::new(component, sandbox);
        let agents = self.config.agents_per_component.clamp(1, targets.len());
        let jobs = (0..agents).map(|index| AgentJob {
            component,
            request,
            workspace: &workspace,
            base,
            candidate,
            index,
            targets: targets.iter().skip(index).step_by(agents).cloned().collect(),
        });
        try_join_all(jobs.map(|job| self.run_agent(job, cancel))).await?;
        Ok(workspace.into_files())
    }

    async fn run_agent(&self, job: AgentJob<'_>, cancel: &CancellationToken) -> ForgeResult<()> {
        let _permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ForgeError::AbortRequested),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| ForgeError::AbortRequested)?
            }
        };
        self.res.budget.check()?;

        let component = job.component;
        let mode = job.request.mode;
        let agent_id = *self
            .agents
            .entry((component.id, job.candidate, job.index))
            .or_insert_with(AgentId::new);

        let mut diagnostics = job.request.diagnostics.clone();
        if !component.flagged_paths.is_empty() {
            let flagged: Vec<&str> = component.flagged_paths.iter().map(WorkspacePath::as_str).collect();
            diagnostics.push(format!("paths rejected by the last merge: {}", flagged.join(", ")));
        }
        let existing = if mode.starts_clean() {
            BTreeMap::new()
        } else {
            job.targets
                .iter()
                .filter_map(|p| job.base.read_text(p).map(|text| (p.clone(), text)))
                .collect()
        };
        let context = PromptContext {
            session_id: self.session_id,
            contract_id: self.contract.id(),
            component_id: component.id,
            component: component.name.clone(),
            agent_id,
            agent_index: job.index,
            candidate: job.candidate,
            mode,
            owned_files: component.owned_files.iter().cloned().collect(),
            target_files: job.targets.clone(),
            interface: component.interface.clone(),
            criteria: component
                .criteria
                .iter()
                .filter_map(|id| self.contract.criterion(id).cloned())
                .collect(),
            diagnostics,
            existing,
            broadcast: self.res.broadcast.read_since(agent_id),
        };
        let input_summary = format!(
            "{mode} {} [{}]",
            component.name,
            job.targets.iter().map(WorkspacePath::as_str).collect::<Vec<_>>().join(", ")
        );

        let started_at = Utc::now();
        let attempt = |status: AttemptStatus, output_files: Vec<(WorkspacePath, ContentHash)>| GenerationAttempt {
            id: AttemptId::new(),
            component_id: component.id,
            agent_id,
            candidate: job.candidate,
            mode,
            input_summary: input_summary.clone(),
            output_files,
            status,
            started_at,
            finished_at: Utc::now(),
        };

        let timeout = self.config.generation_timeout();
        let call = tokio::time::timeout(timeout, self.res.generator.generate(context));
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.res.attempts.record(attempt(AttemptStatus::Discarded, Vec::new()));
                return Err(ForgeError::AbortRequested);
            }
            outcome = call => outcome,
        };

        let output = match outcome {
            Err(_) => {
                tracing::warn!(component = %component.name, agent = %agent_id, "generation timed out");
                self.res.attempts.record(attempt(AttemptStatus::TimedOut, Vec::new()));
                return Err(ForgeError::GenerationTimeout {
                    component: component.name.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            Ok(Err(err)) => {
                self.res.attempts.record(attempt(AttemptStatus::Failed(err.to_string()), Vec::new()));
                return Err(err);
            }
            Ok(Ok(output)) => output,
        };
        self.res.budget.record_generation(output.cost_usd);

        if output.files.is_empty() {
            self.res
                .attempts
                .record(attempt(AttemptStatus::Rejected("no files returned".into()), Vec::new()));
            return Err(ForgeError::Generation {
                component: component.name.clone(),
                message: "generation returned no files".into(),
            });
        }

        let agent_label = format!("agent-{}", job.index);
        let mut written = Vec::with_capacity(output.files.len());
        for file in output.files {
            match job.workspace.write(&file.path, file.content, &agent_label).await {
                Ok(hash) => written.push((file.path, hash)),
                Err(err) => {
                    self.res
                        .attempts
                        .record(attempt(AttemptStatus::Rejected(err.to_string()), written));
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            component = %component.name,
            agent = %agent_id,
            files = written.len(),
            cost = output.cost_usd,
            "generation accepted"
        );
        self.res.audit.append(
            self.session_id.to_string(),
            agent_id.to_string(),
            format!("generate {} ({mode})", component.name),
            format!("{} file(s)", written.len()),
        );
        self.res.attempts.record(attempt(AttemptStatus::Accepted, written));
        Ok(())
    }

    /// Candidate output as a change set against the merged base
    ///
    /// Full rebuilds also delete previously merged files the new build no
    /// longer produces.
    fn change_set(
        &self,
        component: &Component,
        mode: GenerationMode,
        base: &Snapshot,
        files: BTreeMap<WorkspacePath, String>,
    ) -> ChangeSet {
        let mut set = ChangeSet::new(component.name.clone());
        if !mode.is_overlay() {
            for stale in base.paths_owned_by(&component.name) {
                if !files.contains_key(stale) {
                    set.delete(stale.clone());
                }
            }
        }
        for (path, content) in files {
            set.write(path, content.into_bytes());
        }
        set
    }
}
