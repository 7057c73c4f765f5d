//! Testing utilities for the Forge workspace
//!
//! Scripted collaborators, misbehaving checkers and fixture builders.

#![allow(missing_docs)]

use async_trait::async_trait;
use forge_artifact::WorkspacePath;
use forge_core::config::ForgeConfig;
use forge_core::contract::{CriterionDraft, IntentContract, VerificationMethod};
use forge_core::engine::{BuildEngine, Collaborators};
use forge_core::error::{ForgeError, ForgeResult};
use forge_core::partition::{ArchitecturePlan, ComponentSpec, StaticPlanner};
use forge_core::ports::{
    ExecOutput, GeneratedFile, GenerationMode, GenerationOutput, GenerationService, PromptContext, WorkspaceSandbox,
};
use forge_core::sandbox::MemorySandbox;
use forge_core::swarm::{CheckContext, CheckOutcome, Checker, Finding, GatePolicy, Severity};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub fn path(raw: &str) -> WorkspacePath {
    WorkspacePath::new(raw).unwrap()
}

/// `src/ui/index.ts` -> `src_ui_index_ts`
pub fn ident(path: &WorkspacePath) -> String {
    path.as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Source every checker accepts, unique per path
pub fn clean_source(path: &WorkspacePath) -> String {
    format!("export const {} = '{}';\n", ident(path), path)
}

/// What the generator answers for one call
#[derive(Debug, Clone)]
pub enum Reply {
    /// Clean source for every target
    Clean,
    /// Clean source with a TODO marker on top
    Todo,
    /// Exactly these files
    Files(Vec<(String, String)>),
    /// Generation error
    Fail(String),
    /// Never answers
    Hang,
}

/// One recorded generation call
#[derive(Debug, Clone)]
pub struct Call {
    pub component: String,
    pub mode: GenerationMode,
    pub agent_index: usize,
    pub candidate: usize,
    pub targets: Vec<WorkspacePath>,
    pub diagnostics: Vec<String>,
}

/// Generation service answering from per-component scripts
///
/// Scripted replies are consumed in call order; once a component's script
/// runs out its standing reply (default [`Reply::Clean`]) is used.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    standing: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<Call>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for `component`
    pub fn script(self, component: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.scripts
            .lock()
            .entry(component.to_string())
            .or_default()
            .extend(replies);
        self
    }

    /// Reply for `component` once its script is spent
    pub fn always(self, component: &str, reply: Reply) -> Self {
        self.standing.lock().insert(component.to_string(), reply);
        self
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, component: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.component == component)
            .cloned()
            .collect()
    }

    pub fn modes_for(&self, component: &str) -> Vec<GenerationMode> {
        self.calls_for(component).into_iter().map(|c| c.mode).collect()
    }

    /// Most calls in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, component: &str) -> Reply {
        if let Some(reply) = self.scripts.lock().get_mut(component).and_then(VecDeque::pop_front) {
            return reply;
        }
        self.standing
            .lock()
            .get(component)
            .cloned()
            .unwrap_or(Reply::Clean)
    }
}

fn output(files: Vec<GeneratedFile>) -> GenerationOutput {
    GenerationOutput {
        files,
        rationale: "scripted".into(),
        cost_usd: 0.01,
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    async fn generate(&self, context: PromptContext) -> ForgeResult<GenerationOutput> {
        self.calls.lock().push(Call {
            component: context.component.clone(),
            mode: context.mode,
            agent_index: context.agent_index,
            candidate: context.candidate,
            targets: context.target_files.clone(),
            diagnostics: context.diagnostics.clone(),
        });
        let reply = self.next_reply(&context.component);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Reply::Clean => Ok(output(
                context
                    .target_files
                    .iter()
                    .map(|p| GeneratedFile::new(p.clone(), clean_source(p)))
                    .collect(),
            )),
            Reply::Todo => Ok(output(
                context
                    .target_files
                    .iter()
                    .map(|p| GeneratedFile::new(p.clone(), format!("// TODO: finish\n{}", clean_source(p))))
                    .collect(),
            )),
            Reply::Files(files) => Ok(output(
                files
                    .into_iter()
                    .map(|(p, content)| GeneratedFile::new(path(&p), content))
                    .collect(),
            )),
            Reply::Fail(message) => Err(ForgeError::Generation {
                component: context.component,
                message,
            }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Checker whose every run errors
#[derive(Debug)]
pub struct CrashingChecker {
    name: String,
}

impl CrashingChecker {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

#[async_trait]
impl Checker for CrashingChecker {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> GatePolicy {
        GatePolicy::Blocking
    }

    async fn check(&self, _ctx: &CheckContext) -> ForgeResult<CheckOutcome> {
        Err(ForgeError::CheckerCrash {
            checker: self.name.clone(),
            message: "scripted crash".into(),
        })
    }
}

/// Checker that always reports one blocking finding
#[derive(Debug)]
pub struct FailingChecker {
    name: String,
    tag: String,
}

impl FailingChecker {
    pub fn new(name: &str, tag: &str) -> Self {
        Self {
            name: name.to_string(),
            tag: tag.to_string(),
        }
    }
}

#[async_trait]
impl Checker for FailingChecker {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> GatePolicy {
        GatePolicy::Blocking
    }

    async fn check(&self, _ctx: &CheckContext) -> ForgeResult<CheckOutcome> {
        Ok(CheckOutcome {
            score: None,
            findings: vec![Finding::blocking(Severity::High, "scripted failure").with_tag(self.tag.as_str())],
        })
    }
}

/// Memory sandbox that stalls inside its next write once armed
///
/// The stalled write has already landed when `reached` fires; it returns
/// after `release` is notified or the caller drops the future.
#[derive(Debug)]
pub struct GatedSandbox {
    inner: MemorySandbox,
    armed: AtomicBool,
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl GatedSandbox {
    pub fn new(label: &str) -> Self {
        Self {
            inner: MemorySandbox::new(label),
            armed: AtomicBool::new(false),
            reached: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkspaceSandbox for GatedSandbox {
    async fn write_file(&self, path: &WorkspacePath, content: &[u8]) -> ForgeResult<()> {
        self.inner.write_file(path, content).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        Ok(())
    }

    async fn read_file(&self, path: &WorkspacePath) -> ForgeResult<Option<Vec<u8>>> {
        self.inner.read_file(path).await
    }

    async fn delete_file(&self, path: &WorkspacePath) -> ForgeResult<()> {
        self.inner.delete_file(path).await
    }

    async fn exec(&self, command: &str) -> ForgeResult<ExecOutput> {
        self.inner.exec(command).await
    }
}

/// Locked contract with one `FileContains` criterion per `(path, text)`
pub fn locked_contract(request: &str, criteria: &[(&str, &str)]) -> IntentContract {
    let mut contract = IntentContract::draft(request);
    for (file, text) in criteria {
        contract
            .add_criterion(CriterionDraft {
                description: format!("{file} contains {text}"),
                method: Some(VerificationMethod::FileContains {
                    path: path(file),
                    text: (*text).to_string(),
                }),
            })
            .unwrap();
    }
    contract.lock().unwrap();
    contract
}

/// Criterion every clean build of `file` satisfies
pub fn clean_criterion(file: &str) -> (String, String) {
    (file.to_string(), format!("export const {}", ident(&path(file))))
}

/// Independent components, each owning `src/{name}/index.ts`
pub fn flat_plan(names: &[&str]) -> ArchitecturePlan {
    ArchitecturePlan::new(
        names
            .iter()
            .map(|name| ComponentSpec::new(*name, [format!("src/{name}/index.ts").as_str()]))
            .collect(),
    )
}

/// Short timeouts so stuck tests fail fast
pub fn fast_config() -> ForgeConfig {
    ForgeConfig::default()
        .with_generation_timeout(Duration::from_secs(5))
        .with_checker_timeout(Duration::from_secs(5))
}

/// Engine over memory collaborators
pub fn engine(generator: Arc<ScriptedGenerator>, plan: ArchitecturePlan, config: ForgeConfig) -> BuildEngine {
    let planner = Arc::new(StaticPlanner::new(plan));
    BuildEngine::new(config, Collaborators::in_memory(generator, planner))
}
