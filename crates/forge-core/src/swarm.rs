//! Verification Swarm
//!
//! Independent checkers run concurrently against a workspace view. Each
//! checker reports a score and findings; its [`GatePolicy`] turns that into
//! pass/fail. The composite is satisfied only when every checker passed.
//!
//! A checker that errors, panics or times out is recorded as
//! `passed = false` with a blocking `internal-error` finding. There is no
//! path by which a crash becomes a pass.

use crate::checkers;
use crate::config::SwarmConfig;
use crate::contract::IntentContract;
use crate::error::ForgeResult;
use crate::ports::WorkspaceSandbox;
use crate::types::ResultId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forge_artifact::{Snapshot, WorkspacePath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tag carried by findings produced for crashed checkers
pub const INTERNAL_ERROR_TAG: &str = "internal-error";

/// Finding severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational
    Info,
    /// Minor
    Low,
    /// Should fix
    Medium,
    /// Must fix
    High,
    /// Ship-stopper
    Critical,
}

/// One checker observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Severity
    pub severity: Severity,
    /// Human message
    pub message: String,
    /// Fails the checker regardless of score
    pub blocking: bool,
    /// File concerned
    pub path: Option<WorkspacePath>,
    /// Stable category, used for error signatures and known fixes
    pub tag: Option<String>,
}

impl Finding {
    /// Non-blocking finding
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            blocking: false,
            path: None,
            tag: None,
        }
    }

    /// Blocking finding
    #[must_use]
    pub fn blocking(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            blocking: true,
            ..Self::new(severity, message)
        }
    }

    /// Checker crash
    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::blocking(Severity::Critical, message).with_tag(INTERNAL_ERROR_TAG)
    }

    /// With file
    #[inline]
    #[must_use]
    pub fn at(mut self, path: &WorkspacePath) -> Self {
        self.path = Some(path.clone());
        self
    }

    /// With tag
    #[inline]
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Tagged as a checker crash
    #[must_use]
    pub fn is_internal_error(&self) -> bool {
        self.tag.as_deref() == Some(INTERNAL_ERROR_TAG)
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}]", self.severity)?;
        if let Some(path) = &self.path {
            write!(f, " {path}:")?;
        }
        write!(f, " {}", self.message)
    }
}

/// Advisory runs never gate; authoritative runs do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmMode {
    /// During PARALLEL_BUILD, informational only
    Advisory,
    /// At the VERIFICATION gate
    Authoritative,
}

/// How a checker's outcome maps to pass/fail
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "min", rename_all = "snake_case")]
pub enum GatePolicy {
    /// Fails on any blocking finding
    Blocking,
    /// Fails on any critical or blocking finding
    BlockingOnCritical,
    /// Needs a score at or above the minimum and no blocking findings
    Threshold(f64),
    /// Fails on any finding at all
    ZeroTolerance,
}

impl GatePolicy {
    /// Pass/fail for an outcome
    #[must_use]
    pub fn passes(&self, outcome: &CheckOutcome) -> bool {
        let blocked = outcome.findings.iter().any(|f| f.blocking);
        match *self {
            Self::Blocking => !blocked,
            Self::BlockingOnCritical => {
                !blocked && outcome.findings.iter().all(|f| f.severity < Severity::Critical)
            }
            // A threshold checker that produced no score has not met it
            Self::Threshold(min) => !blocked && outcome.score.is_some_and(|s| s >= min),
            Self::ZeroTolerance => outcome.findings.is_empty(),
        }
    }
}

/// Raw checker output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// Score in `[0, 100]`, `None` for unscored checkers
    pub score: Option<f64>,
    /// Findings
    pub findings: Vec<Finding>,
}

/// What a checker looks at
#[derive(Clone)]
pub struct CheckContext {
    /// Files under review
    pub snapshot: Snapshot,
    /// Contract in force (identity, criteria)
    pub contract: Arc<IntentContract>,
    /// Sandbox for command-running checkers; absent when scoring candidates
    pub sandbox: Option<Arc<dyn WorkspaceSandbox>>,
    /// Restrict file-level checks to these paths
    pub scope: Option<BTreeSet<WorkspacePath>>,
}

impl fmt::Debug for CheckContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckContext")
            .field("revision", &self.snapshot.revision())
            .field("files", &self.snapshot.len())
            .field("scope", &self.scope.as_ref().map(BTreeSet::len))
            .finish_non_exhaustive()
    }
}

impl CheckContext {
    /// Context over a snapshot
    #[must_use]
    pub fn new(snapshot: Snapshot, contract: Arc<IntentContract>) -> Self {
        Self {
            snapshot,
            contract,
            sandbox: None,
            scope: None,
        }
    }

    /// With sandbox
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: Arc<dyn WorkspaceSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// With scope
    #[must_use]
    pub fn with_scope(mut self, scope: BTreeSet<WorkspacePath>) -> Self {
        self.scope = Some(scope);
        self
    }

    /// In-scope files with their text, path order
    #[must_use]
    pub fn text_files(&self) -> Vec<(WorkspacePath, String)> {
        self.snapshot
            .paths()
            .filter(|p| self.scope.as_ref().map_or(true, |s| s.contains(*p)))
            .filter_map(|p| self.snapshot.read_text(p).map(|text| (p.clone(), text)))
            .collect()
    }
}

/// Uniform checker capability
#[async_trait]
pub trait Checker: Send + Sync + fmt::Debug {
    /// Stable name
    fn name(&self) -> &str;
    /// Gate policy
    fn policy(&self) -> GatePolicy;
    /// Inspect the context
    async fn check(&self, ctx: &CheckContext) -> ForgeResult<CheckOutcome>;
}

/// Appended record of one checker run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Id
    pub id: ResultId,
    /// Checker name
    pub checker: String,
    /// Pass/fail under the checker's policy
    pub passed: bool,
    /// Score, if any
    pub score: Option<f64>,
    /// Findings
    pub findings: Vec<Finding>,
    /// Run mode
    pub mode: SwarmMode,
    /// Completion time
    pub at: DateTime<Utc>,
    /// Run time
    pub duration_ms: u64,
}

impl VerificationResult {
    /// Blocking findings only
    pub fn blocking_findings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.blocking)
    }

    /// The checker crashed
    #[must_use]
    pub fn crashed(&self) -> bool {
        self.findings.iter().any(Finding::is_internal_error)
    }
}

/// Composite result of one swarm run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmReport {
    /// Run mode
    pub mode: SwarmMode,
    /// One result per checker, in registration order
    pub results: Vec<VerificationResult>,
    /// Every checker passed
    pub satisfied: bool,
}

impl SwarmReport {
    /// Mean of the scores that exist
    #[must_use]
    pub fn composite_score(&self) -> Option<f64> {
        let scores: Vec<f64> = self.results.iter().filter_map(|r| r.score).collect();
        (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64)
    }

    /// Results that failed
    pub fn failures(&self) -> impl Iterator<Item = &VerificationResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    /// Total findings
    #[must_use]
    pub fn finding_count(&self) -> usize {
        self.results.iter().map(|r| r.findings.len()).sum()
    }
}

/// Tournament ranking data for one candidate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    /// Every checker passed
    pub satisfied: bool,
    /// Composite score (0 when nothing scored)
    pub score: f64,
    /// Total findings
    pub findings: usize,
}

impl CandidateScore {
    /// Ranking key: satisfied first, then score, then fewer findings
    #[must_use]
    pub fn beats(&self, other: &CandidateScore) -> bool {
        if self.satisfied != other.satisfied {
            return self.satisfied;
        }
        if (self.score - other.score).abs() > f64::EPSILON {
            return self.score > other.score;
        }
        self.findings < other.findings
    }
}

/// Index of the winning candidate; ties go to the lower index
#[must_use]
pub fn select_winner(scores: &[CandidateScore]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, score) in scores.iter().enumerate() {
        match best {
            Some(b) if !score.beats(&scores[b]) => {}
            _ => best = Some(idx),
        }
    }
    best
}

/// The fixed checker set plus its run settings
#[derive(Debug, Clone)]
pub struct VerificationSwarm {
    checkers: Vec<Arc<dyn Checker>>,
    timeout: Duration,
}

impl VerificationSwarm {
    /// Swarm with no checkers
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            checkers: Vec::new(),
            timeout,
        }
    }

    /// The six standard checkers
    #[must_use]
    pub fn standard(config: &SwarmConfig) -> Self {
        let t = &config.thresholds;
        Self::new(config.checker_timeout())
            .with_checker(Arc::new(checkers::CorrectnessChecker::new(
                config.correctness_command.clone(),
            )))
            .with_checker(Arc::new(checkers::StructuralQualityChecker::new(t.structural_quality)))
            .with_checker(Arc::new(checkers::VisualDesignChecker::new(t.visual_design)))
            .with_checker(Arc::new(checkers::SecurityChecker::new()))
            .with_checker(Arc::new(checkers::PlaceholderChecker::new()))
            .with_checker(Arc::new(checkers::StyleConsistencyChecker::new(t.style_consistency)))
    }

    /// Add a checker
    #[must_use]
    pub fn with_checker(mut self, checker: Arc<dyn Checker>) -> Self {
        self.checkers.push(checker);
        self
    }

    /// Replace the checker with the same name, or add it
    #[must_use]
    pub fn replacing(mut self, checker: Arc<dyn Checker>) -> Self {
        match self.checkers.iter().position(|c| c.name() == checker.name()) {
            Some(idx) => self.checkers[idx] = checker,
            None => self.checkers.push(checker),
        }
        self
    }

    /// Checker names, in run order
    #[must_use]
    pub fn checker_names(&self) -> Vec<String> {
        self.checkers.iter().map(|c| c.name().to_string()).collect()
    }

    /// Run every checker concurrently
    ///
    /// Each checker runs on its own task so a panic is contained and reported
    /// as a crash.
    pub async fn run(&self, ctx: CheckContext, mode: SwarmMode) -> SwarmReport {
        let ctx = Arc::new(ctx);
        let handles: Vec<_> = self
            .checkers
            .iter()
            .map(|checker| {
                let checker = Arc::clone(checker);
                let ctx = Arc::clone(&ctx);
                let timeout = self.timeout;
                tokio::spawn(async move {
                    let started = Instant::now();
                    let outcome = tokio::time::timeout(timeout, checker.check(&ctx)).await;
                    (outcome, started.elapsed())
                })
            })
            .collect();

        let joined = futures::future::join_all(handles).await;
        let results: Vec<VerificationResult> = self
            .checkers
            .iter()
            .zip(joined)
            .map(|(checker, joined)| {
                let (outcome, elapsed) = match joined {
                    Ok((Ok(Ok(outcome)), elapsed)) => (Ok(outcome), elapsed),
                    Ok((Ok(Err(err)), elapsed)) => (Err(err.to_string()), elapsed),
                    Ok((Err(_), elapsed)) => (
                        Err(format!("timed out after {}ms", self.timeout.as_millis())),
                        elapsed,
                    ),
                    Err(join) => (Err(format!("panicked: {join}")), Duration::ZERO),
                };
                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                match outcome {
                    Ok(outcome) => VerificationResult {
                        id: ResultId::new(),
                        checker: checker.name().to_string(),
                        passed: checker.policy().passes(&outcome),
                        score: outcome.score,
                        findings: outcome.findings,
                        mode,
                        at: Utc::now(),
                        duration_ms,
                    },
                    Err(message) => {
                        tracing::warn!(checker = checker.name(), %message, "checker crashed");
                        VerificationResult {
                            id: ResultId::new(),
                            checker: checker.name().to_string(),
                            passed: false,
                            score: None,
                            findings: vec![Finding::internal_error(format!(
                                "checker {} crashed: {message}",
                                checker.name()
                            ))],
                            mode,
                            at: Utc::now(),
                            duration_ms,
                        }
                    }
                }
            })
            .collect();

        let satisfied = !results.is_empty() && results.iter().all(|r| r.passed);
        tracing::debug!(?mode, satisfied, checkers = results.len(), "swarm run finished");
        SwarmReport {
            mode,
            results,
            satisfied,
        }
    }

    /// Score a tournament candidate's files
    pub async fn score_candidate(&self, ctx: CheckContext) -> CandidateScore {
        let report = self.run(ctx, SwarmMode::Advisory).await;
        CandidateScore {
            satisfied: report.satisfied,
            score: report.composite_score().unwrap_or(0.0),
            findings: report.finding_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForgeError;
    use forge_artifact::SnapshotArena;

    #[derive(Debug)]
    struct Fixed(&'static str, GatePolicy, CheckOutcome);

    #[async_trait]
    impl Checker for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        fn policy(&self) -> GatePolicy {
            self.1
        }
        async fn check(&self, _ctx: &CheckContext) -> ForgeResult<CheckOutcome> {
            Ok(self.2.clone())
        }
    }

    #[derive(Debug)]
    enum Broken {
        Errors,
        Panics,
        Hangs,
    }

    #[async_trait]
    impl Checker for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn policy(&self) -> GatePolicy {
            GatePolicy::Blocking
        }
        async fn check(&self, _ctx: &CheckContext) -> ForgeResult<CheckOutcome> {
            match self {
                Broken::Errors => Err(ForgeError::CheckerCrash {
                    checker: "broken".into(),
                    message: "parser exploded".into(),
                }),
                Broken::Panics => panic!("checker bug"),
                Broken::Hangs => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(CheckOutcome::default())
                }
            }
        }
    }

    fn ctx() -> CheckContext {
        let mut contract = IntentContract::draft("x");
        contract
            .add_criterion(crate::contract::CriterionDraft {
                description: "x".into(),
                method: Some(crate::contract::VerificationMethod::FileExists {
                    path: WorkspacePath::new("x").unwrap(),
                }),
            })
            .unwrap();
        contract.lock().unwrap();
        CheckContext::new(SnapshotArena::new().head(), Arc::new(contract))
    }

    fn passing() -> Arc<dyn Checker> {
        Arc::new(Fixed(
            "ok",
            GatePolicy::Threshold(80.0),
            CheckOutcome {
                score: Some(90.0),
                findings: vec![],
            },
        ))
    }

    #[test]
    fn policies() {
        let low = CheckOutcome {
            score: Some(70.0),
            findings: vec![Finding::new(Severity::Low, "meh")],
        };
        assert!(!GatePolicy::Threshold(80.0).passes(&low));
        assert!(GatePolicy::Threshold(60.0).passes(&low));
        assert!(GatePolicy::Blocking.passes(&low));
        assert!(!GatePolicy::ZeroTolerance.passes(&low));
        assert!(!GatePolicy::Threshold(0.0).passes(&CheckOutcome::default()));

        let critical = CheckOutcome {
            score: None,
            findings: vec![Finding::new(Severity::Critical, "leaked key")],
        };
        assert!(GatePolicy::Blocking.passes(&critical));
        assert!(!GatePolicy::BlockingOnCritical.passes(&critical));
    }

    #[tokio::test]
    async fn every_crash_mode_is_a_blocking_failure() {
        for broken in [Broken::Errors, Broken::Panics, Broken::Hangs] {
            let swarm = VerificationSwarm::new(Duration::from_millis(50))
                .with_checker(passing())
                .with_checker(Arc::new(broken));
            let report = swarm.run(ctx(), SwarmMode::Authoritative).await;
            assert!(!report.satisfied);
            let crashed = &report.results[1];
            assert!(!crashed.passed);
            assert!(crashed.crashed());
            assert_eq!(crashed.blocking_findings().count(), 1);
            assert!(report.results[0].passed);
        }
    }

    #[tokio::test]
    async fn empty_swarm_is_never_satisfied() {
        let report = VerificationSwarm::new(Duration::from_secs(1))
            .run(ctx(), SwarmMode::Authoritative)
            .await;
        assert!(!report.satisfied);
    }

    #[test]
    fn tournament_ranking() {
        let a = CandidateScore { satisfied: false, score: 99.0, findings: 0 };
        let b = CandidateScore { satisfied: true, score: 81.0, findings: 3 };
        let c = CandidateScore { satisfied: true, score: 81.0, findings: 1 };
        let d = CandidateScore { satisfied: true, score: 81.0, findings: 1 };
        assert_eq!(select_winner(&[a, b, c, d]), Some(2));
        assert_eq!(select_winner(&[]), None);
    }

    #[test]
    fn replacing_keeps_order() {
        let swarm = VerificationSwarm::new(Duration::from_secs(1))
            .with_checker(passing())
            .with_checker(Arc::new(Broken::Errors))
            .replacing(Arc::new(Fixed("broken", GatePolicy::Blocking, CheckOutcome::default())));
        assert_eq!(swarm.checker_names(), vec!["ok", "broken"]);
    }
}
