//! Deterministic build simulator
//!
//! Drives a whole session over in-memory collaborators: a static planner, a
//! template generator and memory sandboxes. The generator injects seeded
//! faults into first builds (placeholder markers and service failures) so a
//! run exercises escalation, remediation and learning capture. Remediation
//! modes always produce clean output, so every run should converge.

use crate::config::ForgeConfig;
use crate::contract::{CriterionDraft, IntentContract, VerificationMethod};
use crate::engine::{BuildEngine, Collaborators};
use crate::error::{ForgeError, ForgeResult};
use crate::events::{BuildSummary, EventKind};
use crate::partition::{ArchitecturePlan, ComponentSpec, StaticPlanner};
use crate::ports::{GeneratedFile, GenerationMode, GenerationOutput, GenerationService, PromptContext};
use crate::types::SessionId;
use async_trait::async_trait;
use forge_artifact::WorkspacePath;
use forge_kernel::{Phase, SessionStatus};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const NAMES: &[&str] = &["core", "api", "ui", "auth", "billing", "search", "notify", "admin"];
const COST_PER_FILE_USD: f64 = 0.002;

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Components in the planned application
    pub components: usize,
    /// Chance a first build leaves a placeholder marker
    pub placeholder_rate: f64,
    /// Chance a first build call fails outright
    pub failure_rate: f64,
    /// Engine configuration
    pub engine: ForgeConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            components: 4,
            placeholder_rate: 0.25,
            failure_rate: 0.1,
            engine: ForgeConfig::default(),
        }
    }
}

/// Faults the generator injected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    /// Generation calls served
    pub calls: u64,
    /// Files written with a placeholder marker
    pub placeholders: u64,
    /// Calls failed on purpose
    pub failures: u64,
}

/// Template-driven generation service with seeded fault injection
#[derive(Debug)]
pub struct TemplateGenerator {
    rng: Mutex<StdRng>,
    placeholder_rate: f64,
    failure_rate: f64,
    calls: AtomicU64,
    placeholders: AtomicU64,
    failures: AtomicU64,
}

impl TemplateGenerator {
    /// Generator seeded with `seed`
    #[must_use]
    pub fn new(seed: u64, placeholder_rate: f64, failure_rate: f64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            placeholder_rate: placeholder_rate.clamp(0.0, 1.0),
            failure_rate: failure_rate.clamp(0.0, 1.0),
            calls: AtomicU64::new(0),
            placeholders: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Generator that never injects faults
    #[must_use]
    pub fn clean() -> Self {
        Self::new(0, 0.0, 0.0)
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> FaultStats {
        FaultStats {
            calls: self.calls.load(Ordering::Relaxed),
            placeholders: self.placeholders.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl GenerationService for TemplateGenerator {
    async fn generate(&self, context: PromptContext) -> ForgeResult<GenerationOutput> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let first_build = context.mode == GenerationMode::Build;
        let targets = if context.target_files.is_empty() {
            &context.owned_files
        } else {
            &context.target_files
        };

        let (fail, marks): (bool, Vec<bool>) = {
            let mut rng = self.rng.lock();
            let fail = first_build && rng.random_bool(self.failure_rate);
            let marks = targets
                .iter()
                .map(|_| first_build && rng.random_bool(self.placeholder_rate))
                .collect();
            (fail, marks)
        };
        if fail {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(ForgeError::Generation {
                component: context.component.clone(),
                message: "simulated service failure".into(),
            });
        }

        let dependencies: Vec<&str> = context
            .interface
            .consumes
            .iter()
            .map(String::as_str)
            .collect();
        let files: Vec<GeneratedFile> = targets
            .iter()
            .zip(marks)
            .map(|(path, mark)| {
                if mark {
                    self.placeholders.fetch_add(1, Ordering::Relaxed);
                }
                GeneratedFile::new(path.clone(), render(path, &context.component, &dependencies, mark))
            })
            .collect();
        let cost_usd = COST_PER_FILE_USD * files.len() as f64;
        Ok(GenerationOutput {
            rationale: format!("{} {} file(s) for {}", context.mode, files.len(), context.component),
            files,
            cost_usd,
        })
    }
}

fn ident(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn render(path: &WorkspacePath, component: &str, dependencies: &[&str], placeholder: bool) -> String {
    let mut out = String::new();
    let entry = path.file_name() == "index.ts";
    if entry {
        for dep in dependencies {
            let _ = writeln!(out, "import {{ {} }} from '../{dep}/index';", ident(dep));
        }
        if !dependencies.is_empty() {
            out.push('\n');
        }
    }
    if placeholder {
        let _ = writeln!(out, "// TODO finish {component}");
    }
    let name = ident(component);
    if entry {
        let _ = writeln!(out, "export const {name} = {{");
        let _ = writeln!(out, "  name: '{component}',");
        let uses: Vec<String> = dependencies.iter().map(|d| format!("{}.name", ident(d))).collect();
        let _ = writeln!(out, "  uses: [{}],", uses.join(", "));
        out.push_str("};\n");
    } else {
        let _ = writeln!(out, "export const {name}Source = '{path}';");
    }
    out
}

/// Planned application: component `i > 0` depends on `core`, every third
/// one also on its predecessor
#[must_use]
pub fn simulated_plan(components: usize) -> ArchitecturePlan {
    let names: Vec<String> = (0..components.max(1))
        .map(|i| match NAMES.get(i) {
            Some(name) => (*name).to_string(),
            None => format!("module{i}"),
        })
        .collect();
    let specs = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let index = format!("src/{name}/index.ts");
            let model = format!("src/{name}/model.ts");
            let criterion = format!("C{}", i + 1);
            let mut spec = ComponentSpec::new(name.clone(), [index.as_str(), model.as_str()])
                .with_criteria([criterion.as_str()])
                .with_feature(if i % 2 == 0 { "platform" } else { "product" });
            let mut deps: Vec<&str> = Vec::new();
            if i > 0 {
                deps.push(&names[0]);
            }
            if i > 1 && i % 3 == 0 {
                deps.push(&names[i - 1]);
            }
            spec.interface.provides.push(name.clone());
            spec.interface.consumes.extend(deps.iter().map(|d| (*d).to_string()));
            spec = spec.depends_on(deps);
            spec
        })
        .collect();
    ArchitecturePlan::new(specs)
}

/// Locked contract requiring each planned entry point to export its component
///
/// # Errors
/// [`ForgeError::Path`] for invalid component names
pub fn simulated_contract(plan: &ArchitecturePlan) -> ForgeResult<IntentContract> {
    let mut contract = IntentContract::draft(format!("simulated application with {} components", plan.components.len()));
    for spec in &plan.components {
        let path = WorkspacePath::new(format!("src/{}/index.ts", spec.name))?;
        contract.add_criterion(CriterionDraft {
            description: format!("{} exports its module", spec.name),
            method: Some(VerificationMethod::FileContains {
                path,
                text: format!("export const {} =", ident(&spec.name)),
            }),
        })?;
    }
    contract.lock()?;
    Ok(contract)
}

/// Final report from one simulated session
#[derive(Debug, Clone)]
pub struct SimulatorReport {
    /// Configuration used
    pub config: SimulatorConfig,
    /// Session
    pub session_id: SessionId,
    /// Final status
    pub status: SessionStatus,
    /// Final phase
    pub phase: Phase,
    /// Phases visited, in order
    pub phases: Vec<Phase>,
    /// Escalation steps issued
    pub escalations: usize,
    /// Fixes learned during the run
    pub learned_fixes: usize,
    /// Injected faults
    pub faults: FaultStats,
    /// Summary, when completed
    pub summary: Option<BuildSummary>,
    /// Pause or abort reason
    pub reason: Option<String>,
}

impl SimulatorReport {
    /// Session completed
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    /// Text report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        report.push_str("=== Forge Simulator Report ===\n\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(report, "Session: {}", self.session_id);
        let _ = writeln!(report, "Components: {}", self.config.components);
        let _ = writeln!(report, "Generation Calls: {}", self.faults.calls);
        let _ = writeln!(report, "Injected Placeholders: {}", self.faults.placeholders);
        let _ = writeln!(report, "Injected Failures: {}", self.faults.failures);
        let _ = writeln!(report, "Escalation Steps: {}", self.escalations);
        let _ = writeln!(report, "Learned Fixes: {}", self.learned_fixes);
        let path: Vec<&str> = self.phases.iter().map(|p| p.as_str()).collect();
        let _ = writeln!(report, "Phases: {}", path.join(" -> "));
        if let Some(summary) = &self.summary {
            let _ = writeln!(report, "Merged: {}", summary.components_merged);
            let _ = writeln!(report, "Cost: ${:.3}", summary.cost_usd);
            let _ = writeln!(report, "Duration: {}", summary.duration_human);
        }
        if let Some(reason) = &self.reason {
            let _ = writeln!(report, "Reason: {reason}");
        }
        let _ = write!(
            report,
            "\n=== Result: {} ({:?} in {}) ===\n",
            if self.passed() { "PASS" } else { "FAIL" },
            self.status,
            self.phase
        );
        report
    }
}

/// Run one simulated session to a terminal or paused state
///
/// # Errors
/// Errors from starting the session; failures during the build end up in
/// the report
pub async fn run_simulator(config: SimulatorConfig) -> ForgeResult<SimulatorReport> {
    let plan = simulated_plan(config.components);
    let contract = simulated_contract(&plan)?;
    let generator = Arc::new(TemplateGenerator::new(config.seed, config.placeholder_rate, config.failure_rate));
    let collaborators = Collaborators::in_memory(
        Arc::clone(&generator) as Arc<dyn GenerationService>,
        Arc::new(StaticPlanner::new(plan)),
    );
    let engine = BuildEngine::new(config.engine.clone(), collaborators);
    let fixes_before = engine.known_fixes().len();

    let session_id = engine.start_with_contract(contract)?;
    let session = engine.wait(session_id).await?;

    let history = engine.history(session_id);
    let mut phases = vec![Phase::IntentLock];
    phases.extend(history.iter().filter_map(|e| match &e.kind {
        EventKind::PhaseTransition { to, .. } => Some(*to),
        _ => None,
    }));
    let escalations = history
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Escalation { .. }))
        .count();

    Ok(SimulatorReport {
        config,
        session_id,
        status: session.status,
        phase: session.current_phase,
        phases,
        escalations,
        learned_fixes: engine.known_fixes().len().saturating_sub(fixes_before),
        faults: generator.stats(),
        reason: session.pause_reason.clone().or_else(|| session.abort_reason.clone()),
        summary: session.summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_is_a_dag_rooted_at_core() {
        let plan = simulated_plan(5);
        assert_eq!(plan.components.len(), 5);
        assert!(plan.components[0].depends_on.is_empty());
        assert_eq!(plan.components[3].depends_on, vec!["core".to_string(), "ui".to_string()]);
        let contract = simulated_contract(&plan).unwrap();
        assert!(contract.is_locked());
        assert_eq!(contract.criteria().len(), 5);
    }

    #[test]
    fn templates_import_dependencies() {
        let path = WorkspacePath::new("src/api/index.ts").unwrap();
        let text = render(&path, "api", &["core"], false);
        assert!(text.starts_with("import { core } from '../core/index';\n"));
        assert!(text.contains("export const api = {"));
        assert!(render(&path, "api", &[], true).contains("TODO"));
    }

    #[tokio::test]
    async fn clean_run_completes_without_escalation() {
        let report = run_simulator(SimulatorConfig {
            placeholder_rate: 0.0,
            failure_rate: 0.0,
            ..SimulatorConfig::default()
        })
        .await
        .unwrap();
        assert!(report.passed(), "{}", report.generate_text());
        assert_eq!(report.escalations, 0);
        assert_eq!(report.phase, Phase::Terminal);
        assert_eq!(report.summary.as_ref().unwrap().components_merged, 4);
    }

    #[tokio::test]
    async fn placeholders_are_remediated() {
        let report = run_simulator(SimulatorConfig {
            placeholder_rate: 1.0,
            failure_rate: 0.0,
            components: 2,
            ..SimulatorConfig::default()
        })
        .await
        .unwrap();
        assert!(report.passed(), "{}", report.generate_text());
        assert!(report.faults.placeholders > 0);
        assert!(report.escalations >= 1);
        assert!(report.phases.contains(&Phase::Verification));
    }
}
