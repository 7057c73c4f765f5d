//! Error escalation ladder
//!
//! A failure becomes a remediation step at the lowest level not yet spent for
//! its signature, never below the session floor. Each level has an attempt
//! budget; when it runs out the next, more destructive level takes over.
//!
//! | Level | Scope | Generation |
//! |---|---|---|
//! | 0 | templated fix from the [`KnownFixLibrary`] | none |
//! | 1 | failing files only | yes |
//! | 2 | owning component, with diagnostics | yes |
//! | 3 | owning component, from its interface | yes |
//! | 4 | every component of the feature | yes, terminal on failure |

use crate::config::EscalationConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::swarm::Finding;
use crate::types::{ComponentId, EscalationId, SessionId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use forge_artifact::{Snapshot, WorkspacePath};
use forge_kernel::Phase;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

const SIGNATURE_LEN: usize = 120;

/// Ladder rung
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EscalationLevel {
    /// Templated fix keyed by signature
    KnownPattern = 0,
    /// Regenerate the failing files
    LocalFix = 1,
    /// Regenerate the owning component with diagnostics
    ComponentFix = 2,
    /// Discard and regenerate the component from its interface
    ComponentRewrite = 3,
    /// Regenerate every component of the feature
    FeatureRewrite = 4,
}

impl EscalationLevel {
    /// All levels, lowest first
    pub const ALL: [Self; 5] = [
        Self::KnownPattern,
        Self::LocalFix,
        Self::ComponentFix,
        Self::ComponentRewrite,
        Self::FeatureRewrite,
    ];

    /// Numeric level
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Next level up, `None` at the top
    #[inline]
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::KnownPattern => "known-pattern",
            Self::LocalFix => "local-fix",
            Self::ComponentFix => "component-fix",
            Self::ComponentRewrite => "component-rewrite",
            Self::FeatureRewrite => "feature-rewrite",
        };
        write!(f, "L{} {name}", self.index())
    }
}

/// Where a failure was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    /// Generation or merge in PARALLEL_BUILD
    Build,
    /// INTEGRATION findings
    Integration,
    /// FUNCTIONAL_TEST commands
    FunctionalTest,
    /// Authoritative swarm at VERIFICATION
    Verification,
}

impl FailureSource {
    /// Phase whose exit predicate proves a fix worked
    #[must_use]
    pub fn phase(self) -> Phase {
        match self {
            Self::Build => Phase::ParallelBuild,
            Self::Integration => Phase::Integration,
            Self::FunctionalTest => Phase::FunctionalTest,
            Self::Verification => Phase::Verification,
        }
    }
}

impl fmt::Display for FailureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Build => "build",
            Self::Integration => "integration",
            Self::FunctionalTest => "functional-test",
            Self::Verification => "verification",
        })
    }
}

/// Stable identity of an error across attempts
///
/// Line numbers and other digits are masked so the same defect keeps its
/// signature after a regeneration shifts it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorSignature(String);

impl ErrorSignature {
    /// Signature from a source and a tag or message
    #[must_use]
    pub fn new(source: FailureSource, key: &str) -> Self {
        let mut normalized = String::with_capacity(key.len());
        let mut last_space = true;
        for c in key.chars() {
            if c.is_whitespace() {
                if !last_space {
                    normalized.push(' ');
                }
                last_space = true;
                continue;
            }
            last_space = false;
            if c.is_ascii_digit() {
                normalized.push('#');
            } else {
                normalized.extend(c.to_lowercase());
            }
        }
        let normalized: String = normalized.trim_end().chars().take(SIGNATURE_LEN).collect();
        Self(format!("{source}:{normalized}"))
    }

    /// As string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A failure handed to the ladder
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    /// Signature
    pub signature: ErrorSignature,
    /// Where it was seen
    pub source: FailureSource,
    /// One-line summary, used as generation diagnostics
    pub summary: String,
    /// Files implicated, if known
    pub paths: BTreeSet<WorkspacePath>,
    /// Components implicated, if known
    pub components: BTreeSet<ComponentId>,
    /// Findings behind the failure
    pub findings: Vec<Finding>,
}

impl Failure {
    /// Failure keyed by `key` (a finding tag or error message)
    #[must_use]
    pub fn new(source: FailureSource, key: &str, summary: impl Into<String>) -> Self {
        Self {
            signature: ErrorSignature::new(source, key),
            source,
            summary: summary.into(),
            paths: BTreeSet::new(),
            components: BTreeSet::new(),
            findings: Vec::new(),
        }
    }

    /// With implicated paths
    #[must_use]
    pub fn with_paths(mut self, paths: impl IntoIterator<Item = WorkspacePath>) -> Self {
        self.paths.extend(paths);
        self
    }

    /// With implicated components
    #[must_use]
    pub fn with_components(mut self, components: impl IntoIterator<Item = ComponentId>) -> Self {
        self.components.extend(components);
        self
    }

    /// With findings; their paths are added too
    #[must_use]
    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.paths.extend(findings.iter().filter_map(|f| f.path.clone()));
        self.findings = findings;
        self
    }
}

/// Remediation the driver must carry out
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationStep {
    /// Record id
    pub id: EscalationId,
    /// Level
    pub level: EscalationLevel,
    /// Attempt number at this level for this signature, from 1
    pub attempt: u32,
    /// What failed
    pub failure: Failure,
}

/// Outcome of one escalation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationOutcome {
    /// Issued, not yet judged
    Pending,
    /// The failing phase passed afterwards
    Resolved,
    /// The same signature came back
    Failed,
    /// A different failure arrived before this one was judged
    Superseded,
    /// Level 4 failed; the ladder is spent
    Exhausted,
}

/// Persisted trace of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    /// Record id
    pub id: EscalationId,
    /// Session
    pub session_id: SessionId,
    /// Level
    pub level: EscalationLevel,
    /// Triggering error signature
    pub signature: String,
    /// Attempt number at this level
    pub attempt: u32,
    /// Outcome so far
    pub outcome: EscalationOutcome,
    /// Failure summary
    pub trigger: String,
    /// Last update
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SignatureState {
    level: Option<EscalationLevel>,
    attempts: [u32; 5],
}

/// Per-session ladder state
#[derive(Debug)]
pub struct EscalationLadder {
    session_id: SessionId,
    config: EscalationConfig,
    floor: Option<EscalationLevel>,
    signatures: HashMap<ErrorSignature, SignatureState>,
    pending: Option<EscalationStep>,
    records: Vec<EscalationRecord>,
    exhausted: Option<ErrorSignature>,
}

impl EscalationLadder {
    /// Fresh ladder
    #[must_use]
    pub fn new(session_id: SessionId, config: EscalationConfig) -> Self {
        Self {
            session_id,
            config,
            floor: None,
            signatures: HashMap::new(),
            pending: None,
            records: Vec::new(),
            exhausted: None,
        }
    }

    /// Restore the floor of a resumed session
    #[must_use]
    pub fn with_floor(mut self, floor: EscalationLevel) -> Self {
        self.floor = Some(floor);
        self
    }

    /// Highest level issued so far
    #[inline]
    #[must_use]
    pub fn floor(&self) -> Option<EscalationLevel> {
        self.floor
    }

    /// Every record, in issue order, latest state
    #[must_use]
    pub fn records(&self) -> &[EscalationRecord] {
        &self.records
    }

    /// Source of the step awaiting judgement
    #[must_use]
    pub fn pending_source(&self) -> Option<FailureSource> {
        self.pending.as_ref().map(|s| s.failure.source)
    }

    /// Step awaiting judgement
    #[must_use]
    pub fn pending(&self) -> Option<&EscalationStep> {
        self.pending.as_ref()
    }

    /// Issue the next step for `failure`
    ///
    /// A pending step is closed first: failed if the signature repeats,
    /// superseded otherwise. A failed level 4 step ends the ladder.
    ///
    /// # Errors
    /// [`ForgeError::EscalationExhausted`] when no level has budget left
    pub fn next_step(&mut self, failure: Failure, has_known_fix: bool) -> ForgeResult<EscalationStep> {
        if let Some(signature) = &self.exhausted {
            return Err(ForgeError::EscalationExhausted {
                signature: signature.to_string(),
            });
        }

        if let Some(pending) = self.pending.take() {
            // Level 4 is the last rung whatever failed after it
            if pending.level == EscalationLevel::FeatureRewrite {
                self.close(&pending, EscalationOutcome::Exhausted);
                return Err(self.exhaust(failure.signature));
            }
            let repeated = pending.failure.signature == failure.signature;
            let outcome = if repeated {
                EscalationOutcome::Failed
            } else {
                EscalationOutcome::Superseded
            };
            self.close(&pending, outcome);
        }

        let first = if has_known_fix {
            EscalationLevel::KnownPattern
        } else {
            EscalationLevel::LocalFix
        };
        let chosen = {
            let state = self.signatures.entry(failure.signature.clone()).or_default();
            let mut level = state.level.unwrap_or(first).max(self.floor.unwrap_or(first));
            if level == EscalationLevel::KnownPattern && !has_known_fix {
                level = EscalationLevel::LocalFix;
            }
            loop {
                if state.attempts[level.index()] < self.config.budget(level) {
                    state.level = Some(level);
                    state.attempts[level.index()] += 1;
                    break Some((level, state.attempts[level.index()]));
                }
                match level.next() {
                    Some(next) => level = next,
                    None => break None,
                }
            }
        };
        let Some((level, attempt)) = chosen else {
            return Err(self.exhaust(failure.signature));
        };
        self.floor = Some(self.floor.map_or(level, |f| f.max(level)));

        let step = EscalationStep {
            id: EscalationId::new(),
            level,
            attempt,
            failure,
        };
        tracing::info!(
            session = %self.session_id,
            level = %step.level,
            attempt,
            signature = %step.failure.signature,
            "escalation step issued"
        );
        self.records.push(EscalationRecord {
            id: step.id,
            session_id: self.session_id,
            level,
            signature: step.failure.signature.to_string(),
            attempt,
            outcome: EscalationOutcome::Pending,
            trigger: step.failure.summary.clone(),
            at: Utc::now(),
        });
        self.pending = Some(step.clone());
        Ok(step)
    }

    /// Judge the pending step; returns the updated record
    pub fn record_outcome(&mut self, resolved: bool) -> Option<EscalationRecord> {
        let pending = self.pending.take()?;
        if resolved {
            return self.close(&pending, EscalationOutcome::Resolved);
        }
        if pending.level == EscalationLevel::FeatureRewrite {
            let record = self.close(&pending, EscalationOutcome::Exhausted);
            self.exhausted = Some(pending.failure.signature);
            return record;
        }
        self.close(&pending, EscalationOutcome::Failed)
    }

    fn close(&mut self, step: &EscalationStep, outcome: EscalationOutcome) -> Option<EscalationRecord> {
        let record = self.records.iter_mut().rev().find(|r| r.id == step.id)?;
        record.outcome = outcome;
        record.at = Utc::now();
        Some(record.clone())
    }

    fn exhaust(&mut self, signature: ErrorSignature) -> ForgeError {
        tracing::warn!(session = %self.session_id, %signature, "escalation ladder exhausted");
        self.exhausted = Some(signature.clone());
        ForgeError::EscalationExhausted {
            signature: signature.to_string(),
        }
    }
}

/// Templated remediation applied without a generation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixTemplate {
    /// Strip trailing whitespace, convert CRLF, end with a newline
    NormalizeWhitespace,
    /// Replace literal text
    ReplaceText {
        /// Text to find
        from: String,
        /// Replacement
        to: String,
    },
    /// Write a whole file
    WriteFile {
        /// Target
        path: WorkspacePath,
        /// Content
        content: String,
    },
}

impl FixTemplate {
    /// File contents after applying the template to `paths` (all files when
    /// empty); unchanged files are left out
    #[must_use]
    pub fn render(&self, snapshot: &Snapshot, paths: &BTreeSet<WorkspacePath>) -> BTreeMap<WorkspacePath, Vec<u8>> {
        let targets: Vec<WorkspacePath> = if paths.is_empty() {
            snapshot.paths().cloned().collect()
        } else {
            paths.iter().cloned().collect()
        };
        let mut out = BTreeMap::new();
        match self {
            Self::WriteFile { path, content } => {
                if snapshot.read_text(path).as_deref() != Some(content.as_str()) {
                    out.insert(path.clone(), content.clone().into_bytes());
                }
            }
            Self::NormalizeWhitespace => {
                for path in targets {
                    let Some(text) = snapshot.read_text(&path) else { continue };
                    let mut fixed: String = text
                        .replace("\r\n", "\n")
                        .lines()
                        .map(str::trim_end)
                        .collect::<Vec<_>>()
                        .join("\n");
                    fixed.push('\n');
                    if fixed != text {
                        out.insert(path, fixed.into_bytes());
                    }
                }
            }
            Self::ReplaceText { from, to } => {
                for path in targets {
                    let Some(text) = snapshot.read_text(&path) else { continue };
                    if !from.is_empty() && text.contains(from.as_str()) {
                        out.insert(path, text.replace(from.as_str(), to).into_bytes());
                    }
                }
            }
        }
        out
    }
}

/// Signature-keyed fixes, shared by every session of an engine
#[derive(Debug)]
pub struct KnownFixLibrary {
    fixes: DashMap<String, FixTemplate>,
}

impl Default for KnownFixLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl KnownFixLibrary {
    /// Library seeded with whitespace fixes for the style checker
    #[must_use]
    pub fn new() -> Self {
        let library = Self::empty();
        for tag in ["trailing-whitespace", "missing-final-newline", "crlf-line-endings"] {
            let signature = ErrorSignature::new(FailureSource::Verification, &format!("style-consistency/{tag}"));
            library.learn(&signature, FixTemplate::NormalizeWhitespace);
        }
        library
    }

    /// Library with no fixes
    #[must_use]
    pub fn empty() -> Self {
        Self {
            fixes: DashMap::new(),
        }
    }

    /// Fix for a signature
    #[must_use]
    pub fn lookup(&self, signature: &ErrorSignature) -> Option<FixTemplate> {
        self.fixes.get(signature.as_str()).map(|f| f.value().clone())
    }

    /// Render the known fix for `signature` against `snapshot`
    ///
    /// `None` when no fix is known or the fix changes nothing.
    #[must_use]
    pub fn apply(
        &self,
        signature: &ErrorSignature,
        snapshot: &Snapshot,
        paths: &BTreeSet<WorkspacePath>,
    ) -> Option<BTreeMap<WorkspacePath, Vec<u8>>> {
        let rendered = self.lookup(signature)?.render(snapshot, paths);
        (!rendered.is_empty()).then_some(rendered)
    }

    /// Store a fix
    pub fn learn(&self, signature: &ErrorSignature, template: FixTemplate) {
        tracing::debug!(%signature, "known fix learned");
        self.fixes.insert(signature.to_string(), template);
    }

    /// Derive a fix from a resolved step's before/after state
    ///
    /// Only single-file fixes are learned: a created file becomes
    /// [`FixTemplate::WriteFile`], a one-line change becomes
    /// [`FixTemplate::ReplaceText`].
    pub fn learn_from(
        &self,
        signature: &ErrorSignature,
        paths: &BTreeSet<WorkspacePath>,
        before: &Snapshot,
        after: &Snapshot,
    ) -> Option<FixTemplate> {
        let changed: Vec<&WorkspacePath> = paths
            .iter()
            .filter(|p| before.entry(p).map(|e| e.hash) != after.entry(p).map(|e| e.hash))
            .collect();
        let [path] = changed.as_slice() else { return None };
        let new_text = after.read_text(path)?;
        let template = match before.read_text(path) {
            None => FixTemplate::WriteFile {
                path: (*path).clone(),
                content: new_text,
            },
            Some(old_text) => {
                let old_lines: Vec<&str> = old_text.lines().collect();
                let new_lines: Vec<&str> = new_text.lines().collect();
                if old_lines.len() != new_lines.len() {
                    return None;
                }
                let mut diffs = old_lines.iter().zip(&new_lines).filter(|(a, b)| a != b);
                let (from, to) = diffs.next()?;
                if diffs.next().is_some() || from.trim().is_empty() {
                    return None;
                }
                FixTemplate::ReplaceText {
                    from: (*from).to_string(),
                    to: (*to).to_string(),
                }
            }
        };
        self.learn(signature, template.clone());
        Some(template)
    }

    /// Number of known fixes
    #[must_use]
    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    /// No fixes known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_artifact::{ChangeSet, SnapshotArena};
    use proptest::prelude::*;

    fn ladder(budget: u32) -> EscalationLadder {
        let config = EscalationConfig {
            local_fix_attempts: budget,
            component_fix_attempts: budget,
            component_rewrite_attempts: budget,
            feature_rewrite_attempts: 1,
        };
        EscalationLadder::new(SessionId::new(), config)
    }

    fn failure(key: &str) -> Failure {
        Failure::new(FailureSource::Verification, key, key)
    }

    #[test]
    fn signatures_mask_digits_and_whitespace() {
        let a = ErrorSignature::new(FailureSource::Build, "Error at line 12:   missing  ;");
        let b = ErrorSignature::new(FailureSource::Build, "error at line 40: missing ;");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "build:error at line ##: missing ;");
    }

    #[test]
    fn crash_starts_at_local_fix() {
        let mut ladder = ladder(2);
        let step = ladder.next_step(failure("swarm/internal-error"), false).unwrap();
        assert_eq!(step.level, EscalationLevel::LocalFix);
        assert_eq!(step.attempt, 1);
    }

    #[test]
    fn known_fix_runs_once_then_climbs() {
        let mut ladder = ladder(1);
        let levels: Vec<_> = (0..3)
            .map(|_| ladder.next_step(failure("style/x"), true).unwrap().level)
            .collect();
        assert_eq!(
            levels,
            vec![EscalationLevel::KnownPattern, EscalationLevel::LocalFix, EscalationLevel::ComponentFix]
        );
        assert_eq!(ladder.records()[0].outcome, EscalationOutcome::Failed);
    }

    #[test]
    fn zero_budgets_jump_to_feature_rewrite_which_is_terminal() {
        let mut ladder = ladder(0);
        let step = ladder.next_step(failure("placeholder/todo-marker"), false).unwrap();
        assert_eq!(step.level, EscalationLevel::FeatureRewrite);
        let record = ladder.record_outcome(false).unwrap();
        assert_eq!(record.outcome, EscalationOutcome::Exhausted);
        assert!(matches!(
            ladder.next_step(failure("anything/else"), false),
            Err(ForgeError::EscalationExhausted { .. })
        ));
    }

    #[test]
    fn repeated_feature_rewrite_failure_exhausts() {
        let mut ladder = ladder(0);
        ladder.next_step(failure("a"), false).unwrap();
        assert!(ladder.next_step(failure("a"), false).is_err());
        assert_eq!(ladder.records()[0].outcome, EscalationOutcome::Exhausted);
    }

    #[test]
    fn feature_rewrite_failing_with_a_new_signature_exhausts() {
        let mut ladder = ladder(0);
        ladder.next_step(failure("placeholder/todo-marker"), false).unwrap();
        let err = ladder.next_step(failure("lint/unused"), false).unwrap_err();
        assert!(matches!(err, ForgeError::EscalationExhausted { .. }));
        assert_eq!(ladder.records().len(), 1);
        assert_eq!(ladder.records()[0].outcome, EscalationOutcome::Exhausted);
        assert!(ladder.next_step(failure("third/one"), false).is_err());
    }

    #[test]
    fn new_signature_does_not_lower_the_floor() {
        let mut ladder = ladder(1);
        for _ in 0..3 {
            ladder.next_step(failure("a"), false).unwrap();
        }
        assert_eq!(ladder.floor(), Some(EscalationLevel::ComponentRewrite));
        ladder.record_outcome(true);
        let step = ladder.next_step(failure("b"), true).unwrap();
        assert_eq!(step.level, EscalationLevel::ComponentRewrite);
    }

    #[test]
    fn resolution_is_recorded() {
        let mut ladder = ladder(3);
        ladder.next_step(failure("a"), false).unwrap();
        assert_eq!(ladder.pending_source(), Some(FailureSource::Verification));
        let record = ladder.record_outcome(true).unwrap();
        assert_eq!(record.outcome, EscalationOutcome::Resolved);
        assert!(ladder.pending().is_none());
    }

    proptest! {
        #[test]
        fn floor_never_decreases(keys in prop::collection::vec(0u8..4, 1..40), budget in 1u32..3) {
            let mut ladder = ladder(budget);
            let mut last = None;
            for key in keys {
                let Ok(step) = ladder.next_step(failure(&format!("sig-{}", char::from(b'a' + key))), key == 0) else {
                    break;
                };
                prop_assert!(Some(step.level) >= last);
                prop_assert!(ladder.floor() >= last);
                last = ladder.floor();
            }
        }
    }

    #[test]
    fn whitespace_template_normalizes() {
        let mut set = ChangeSet::new("ui");
        let path = WorkspacePath::new("src/a.ts").unwrap();
        set.write(path.clone(), b"let a = 1;  \r\nlet b = 2;".to_vec());
        let snapshot = SnapshotArena::new().head().overlay(&set);
        let out = FixTemplate::NormalizeWhitespace.render(&snapshot, &BTreeSet::new());
        assert_eq!(out[&path], b"let a = 1;\nlet b = 2;\n".to_vec());
    }

    #[test]
    fn builtin_fixes_cover_style_hygiene() {
        let library = KnownFixLibrary::new();
        let sig = ErrorSignature::new(FailureSource::Verification, "style-consistency/crlf-line-endings");
        assert_eq!(library.lookup(&sig), Some(FixTemplate::NormalizeWhitespace));
        assert!(KnownFixLibrary::empty().lookup(&sig).is_none());
    }

    #[test]
    fn one_line_fixes_are_learned() {
        let path = WorkspacePath::new("src/a.ts").unwrap();
        let mut before = ChangeSet::new("ui");
        before.write(path.clone(), b"import x from './y';\nexport default x;\n".to_vec());
        let before = SnapshotArena::new().head().overlay(&before);
        let mut after = ChangeSet::new("ui");
        after.write(path.clone(), b"import x from './x';\nexport default x;\n".to_vec());
        let after = before.overlay(&after);

        let library = KnownFixLibrary::empty();
        let sig = ErrorSignature::new(FailureSource::Integration, "dead-reference ./y");
        let learned = library.learn_from(&sig, &BTreeSet::from([path]), &before, &after);
        assert_eq!(
            learned,
            Some(FixTemplate::ReplaceText {
                from: "import x from './y';".into(),
                to: "import x from './x';".into(),
            })
        );
        assert_eq!(library.len(), 1);
    }
}
