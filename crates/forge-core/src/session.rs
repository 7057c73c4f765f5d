//! Build session record
//!
//! The session is what callers see through `get_session_status`. Its status
//! always reflects the true state: a terminal status is reached exactly
//! once, the escalation level only rises, and a paused session carries the
//! findings a human needs to act on.

use crate::error::ForgeResult;
use crate::escalation::EscalationLevel;
use crate::events::BuildSummary;
use crate::ports::DeployReceipt;
use crate::swarm::Finding;
use crate::types::{ContractId, SessionId};
use chrono::{DateTime, Utc};
use forge_kernel::{validate_transition, Phase, SessionStatus, TransitionKind};
use serde::{Deserialize, Serialize};

/// One phase change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Phase left
    pub from: Phase,
    /// Phase entered
    pub to: Phase,
    /// Edge type
    pub kind: TransitionKind,
    /// When
    pub at: DateTime<Utc>,
}

/// What DEMO ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoReport {
    /// Command, if one was configured
    pub command: Option<String>,
    /// Exit code of the command
    pub exit_code: Option<i32>,
    /// First lines of stdout
    pub excerpt: String,
    /// Files in the demoed workspace
    pub files: usize,
}

/// A build session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSession {
    /// Id
    pub id: SessionId,
    /// Contract in force
    pub contract_id: ContractId,
    /// Contracts this session has been amended away from, oldest first
    pub superseded_contracts: Vec<ContractId>,
    /// Current phase
    pub current_phase: Phase,
    /// Every phase change
    pub phase_history: Vec<PhaseRecord>,
    /// Status
    pub status: SessionStatus,
    /// Highest escalation level issued
    pub escalation_level: Option<EscalationLevel>,
    /// Findings blocking progress while paused or escalating
    pub unresolved_findings: Vec<Finding>,
    /// Why the session paused
    pub pause_reason: Option<String>,
    /// Why the session aborted
    pub abort_reason: Option<String>,
    /// DEMO outcome
    pub demo: Option<DemoReport>,
    /// DEPLOY outcome
    pub deploy: Option<DeployReceipt>,
    /// Final numbers once completed
    pub summary: Option<BuildSummary>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    /// Time a terminal status was reached
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildSession {
    /// New session at INTENT_LOCK
    #[must_use]
    pub fn new(contract_id: ContractId) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            contract_id,
            superseded_contracts: Vec::new(),
            current_phase: Phase::IntentLock,
            phase_history: Vec::new(),
            status: SessionStatus::Building,
            escalation_level: None,
            unresolved_findings: Vec::new(),
            pause_reason: None,
            abort_reason: None,
            demo: None,
            deploy: None,
            summary: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Terminal status reached
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Waiting for input
    #[inline]
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.status == SessionStatus::PausedNeedsInput
    }

    /// Move to `to`
    ///
    /// # Errors
    /// [`crate::ForgeError::InvalidTransition`] for edges the phase table
    /// does not list
    pub fn transition_to(&mut self, to: Phase) -> ForgeResult<TransitionKind> {
        let kind = validate_transition(self.current_phase, to)?;
        tracing::info!(session = %self.id, from = %self.current_phase, to = %to, ?kind, "phase transition");
        self.phase_history.push(PhaseRecord {
            from: self.current_phase,
            to,
            kind,
            at: Utc::now(),
        });
        self.current_phase = to;
        self.touch();
        Ok(kind)
    }

    /// Change status; setting the current status again is a no-op
    ///
    /// # Errors
    /// [`crate::ForgeError::InvalidTransition`] for edges outside the status
    /// table, including any change after a terminal status
    pub fn set_status(&mut self, to: SessionStatus) -> ForgeResult<()> {
        if self.status == to && !to.is_terminal() {
            return Ok(());
        }
        self.status.validate_transition(to)?;
        tracing::debug!(session = %self.id, from = ?self.status, to = ?to, "session status");
        self.status = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.touch();
        Ok(())
    }

    /// Both machines must accept the move before either one changes
    fn check_finish(&self, to: SessionStatus) -> ForgeResult<()> {
        self.status.validate_transition(to)?;
        if !self.current_phase.is_terminal() {
            validate_transition(self.current_phase, Phase::Terminal)?;
        }
        Ok(())
    }

    /// Raise the escalation level; lower levels are ignored
    pub fn raise_escalation(&mut self, level: EscalationLevel) {
        if self.escalation_level.map_or(true, |current| level > current) {
            self.escalation_level = Some(level);
            self.touch();
        }
    }

    /// Pause for human input, exposing `findings`
    ///
    /// # Errors
    /// As [`BuildSession::set_status`]
    pub fn pause(&mut self, reason: impl Into<String>, findings: Vec<Finding>) -> ForgeResult<()> {
        self.set_status(SessionStatus::PausedNeedsInput)?;
        self.pause_reason = Some(reason.into());
        self.unresolved_findings = findings;
        Ok(())
    }

    /// Leave a pause, or restart a reloaded session, from INIT
    ///
    /// # Errors
    /// As [`BuildSession::set_status`] and [`BuildSession::transition_to`]
    pub fn resume(&mut self) -> ForgeResult<()> {
        if self.status != SessionStatus::Building {
            self.status.validate_transition(SessionStatus::Building)?;
        }
        if self.current_phase > Phase::Init {
            validate_transition(self.current_phase, Phase::Init)?;
        }
        self.set_status(SessionStatus::Building)?;
        self.pause_reason = None;
        if self.current_phase > Phase::Init {
            self.transition_to(Phase::Init)?;
        }
        Ok(())
    }

    /// Switch to an amended contract
    pub fn adopt_contract(&mut self, contract_id: ContractId) {
        if contract_id != self.contract_id {
            self.superseded_contracts.push(self.contract_id);
            self.contract_id = contract_id;
            self.unresolved_findings.clear();
            self.touch();
        }
    }

    /// Abort and move to TERMINAL
    ///
    /// # Errors
    /// [`crate::ForgeError::InvalidTransition`] if already terminal
    pub fn abort(&mut self, reason: impl Into<String>) -> ForgeResult<()> {
        self.check_finish(SessionStatus::Aborted)?;
        if !self.current_phase.is_terminal() {
            self.transition_to(Phase::Terminal)?;
        }
        self.set_status(SessionStatus::Aborted)?;
        self.abort_reason = Some(reason.into());
        Ok(())
    }

    /// Complete from TERMINAL
    ///
    /// # Errors
    /// [`crate::ForgeError::InvalidTransition`] unless the phase machine
    /// already reached TERMINAL through LEARNING_CAPTURE and the status
    /// allows completion
    pub fn complete(&mut self, summary: BuildSummary) -> ForgeResult<()> {
        self.check_finish(SessionStatus::Completed)?;
        if !self.current_phase.is_terminal() {
            self.transition_to(Phase::Terminal)?;
        }
        self.set_status(SessionStatus::Completed)?;
        self.unresolved_findings.clear();
        self.summary = Some(summary);
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::Severity;

    fn summary() -> BuildSummary {
        BuildSummary {
            components_merged: 2,
            components_failed: 0,
            verification_score: Some(97.5),
            cost_usd: 0.0,
            generation_calls: 2,
            duration_ms: 10,
            duration_human: "10ms".into(),
        }
    }

    fn walk(session: &mut BuildSession, phases: &[Phase]) {
        for phase in phases {
            session.transition_to(*phase).unwrap();
        }
    }

    #[test]
    fn happy_path_completes_once() {
        let mut session = BuildSession::new(ContractId::new());
        walk(
            &mut session,
            &[
                Phase::Init,
                Phase::ParallelBuild,
                Phase::Integration,
                Phase::FunctionalTest,
                Phase::IntentSatisfaction,
                Phase::Verification,
                Phase::Demo,
                Phase::LearningCapture,
            ],
        );
        session.complete(summary()).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.current_phase, Phase::Terminal);
        assert!(session.finished_at.is_some());

        assert!(session.complete(summary()).is_err());
        assert!(session.abort("late").is_err());
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[test]
    fn paused_session_cannot_complete() {
        let mut session = BuildSession::new(ContractId::new());
        walk(&mut session, &[Phase::Init, Phase::ParallelBuild]);
        session.set_status(SessionStatus::Escalating).unwrap();
        session
            .pause(
                "ladder exhausted",
                vec![Finding::blocking(Severity::High, "TODO left in src/app.ts")],
            )
            .unwrap();
        assert!(session.is_paused());
        assert_eq!(session.unresolved_findings.len(), 1);
        let history = session.phase_history.len();
        assert!(session.complete(summary()).is_err());
        assert_eq!(session.status, SessionStatus::PausedNeedsInput);
        assert_eq!(session.current_phase, Phase::ParallelBuild);
        assert_eq!(session.phase_history.len(), history);
        assert!(session.summary.is_none());

        session.resume().unwrap();
        assert_eq!(session.status, SessionStatus::Building);
        assert_eq!(session.current_phase, Phase::Init);
        assert_eq!(session.phase_history.last().unwrap().kind, TransitionKind::Resume);
    }

    #[test]
    fn second_abort_is_rejected_without_changes() {
        let mut session = BuildSession::new(ContractId::new());
        walk(&mut session, &[Phase::Init, Phase::ParallelBuild]);
        session.abort("first").unwrap();
        let history = session.phase_history.len();
        assert!(session.abort("second").is_err());
        assert_eq!(session.abort_reason.as_deref(), Some("first"));
        assert_eq!(session.phase_history.len(), history);
    }

    #[test]
    fn escalation_level_never_drops() {
        let mut session = BuildSession::new(ContractId::new());
        session.raise_escalation(EscalationLevel::ComponentFix);
        session.raise_escalation(EscalationLevel::LocalFix);
        assert_eq!(session.escalation_level, Some(EscalationLevel::ComponentFix));
        session.raise_escalation(EscalationLevel::FeatureRewrite);
        assert_eq!(session.escalation_level, Some(EscalationLevel::FeatureRewrite));
    }

    #[test]
    fn abort_goes_terminal() {
        let mut session = BuildSession::new(ContractId::new());
        walk(&mut session, &[Phase::Init, Phase::ParallelBuild]);
        session.abort("cancelled").unwrap();
        assert_eq!(session.status, SessionStatus::Aborted);
        assert_eq!(session.current_phase, Phase::Terminal);
        assert_eq!(session.phase_history.last().unwrap().kind, TransitionKind::Abort);
    }

    #[test]
    fn amendment_chains_contracts() {
        let first = ContractId::new();
        let second = ContractId::new();
        let mut session = BuildSession::new(first);
        session.adopt_contract(second);
        session.adopt_contract(second);
        assert_eq!(session.contract_id, second);
        assert_eq!(session.superseded_contracts, vec![first]);
    }

    #[test]
    fn round_trips_through_json() {
        let mut session = BuildSession::new(ContractId::new());
        session.transition_to(Phase::Init).unwrap();
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"INIT\""));
        let back: BuildSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}
