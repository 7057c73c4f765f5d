//! Progress channel
//!
//! Read-only event stream for UIs and upstream systems. Every event is also
//! kept in a bounded history so late subscribers can catch up.

use crate::error::BudgetKind;
use crate::escalation::EscalationLevel;
use crate::swarm::{SwarmMode, SwarmReport};
use crate::types::{ComponentId, ContractId, CriterionId, SessionId};
use chrono::{DateTime, Utc};
use forge_kernel::{ComponentStatus, Phase, SessionStatus, TransitionKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;
const HISTORY_LIMIT: usize = 10_000;

/// One progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Session the event belongs to
    pub session_id: SessionId,
    /// Emission time
    pub at: DateTime<Utc>,
    /// Payload
    pub kind: EventKind,
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Session accepted
    Started {
        /// Contract being built
        contract_id: ContractId,
    },
    /// Phase change
    PhaseTransition {
        /// Previous phase
        from: Phase,
        /// New phase
        to: Phase,
        /// Edge type
        kind: TransitionKind,
    },
    /// Session status change
    StatusChanged {
        /// New status
        status: SessionStatus,
    },
    /// Partitioning finished
    ComponentsPartitioned {
        /// Number of components
        count: usize,
    },
    /// Component status change
    ComponentStatus {
        /// Component
        component: ComponentId,
        /// Component name
        name: String,
        /// New status
        status: ComponentStatus,
    },
    /// Agents dispatched for a component
    ComponentStarted {
        /// Component name
        name: String,
    },
    /// Component merged
    ComponentCompleted {
        /// Component name
        name: String,
    },
    /// Component build or merge failed
    ComponentFailed {
        /// Component name
        name: String,
        /// Error text
        reason: String,
    },
    /// One checker finished
    VerificationResult {
        /// Checker
        checker: String,
        /// Pass/fail under its policy
        passed: bool,
        /// Score, if the checker scores
        score: Option<f64>,
        /// Blocking findings
        blocking_findings: usize,
        /// Advisory or authoritative
        mode: SwarmMode,
    },
    /// Satisfaction gate evaluated
    GateEvaluated {
        /// Criteria met
        satisfied: usize,
        /// Criteria not met
        unsatisfied: Vec<CriterionId>,
    },
    /// Escalation step issued
    Escalation {
        /// Level
        level: EscalationLevel,
        /// Error signature
        signature: String,
        /// Attempt number at this level
        attempt: u32,
    },
    /// A budget ran out
    BudgetExceeded {
        /// Which one
        budget: BudgetKind,
    },
    /// Session waiting for input
    Paused {
        /// Why
        reason: String,
        /// Unresolved findings exposed on the session
        findings: usize,
    },
    /// Session completed
    Completed(BuildSummary),
    /// Session aborted
    Failed {
        /// Why
        reason: String,
    },
}

/// Final numbers for a completed session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSummary {
    /// Components merged
    pub components_merged: usize,
    /// Components failed
    pub components_failed: usize,
    /// Mean swarm score at VERIFICATION
    pub verification_score: Option<f64>,
    /// Total generation cost
    pub cost_usd: f64,
    /// Generation calls made
    pub generation_calls: u64,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Duration as `42s`, `3m 5s`, `2h 10m` or `1d 4h`
    pub duration_human: String,
}

/// Human duration, coarsest two units
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (days, hours, minutes, seconds) = (secs / 86_400, (secs / 3_600) % 24, (secs / 60) % 60, secs % 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if secs > 0 {
        format!("{seconds}s")
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Broadcast sender plus replayable history
#[derive(Debug)]
pub struct ProgressChannel {
    sender: broadcast::Sender<ProgressEvent>,
    history: Mutex<VecDeque<ProgressEvent>>,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressChannel {
    /// New channel
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Publish an event; having no subscribers is fine
    pub fn emit(&self, session_id: SessionId, kind: EventKind) {
        let event = ProgressEvent {
            session_id,
            at: Utc::now(),
            kind,
        };
        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.sender.send(event);
    }

    /// One `VerificationResult` event per checker in `report`
    pub fn emit_report(&self, session_id: SessionId, report: &SwarmReport) {
        for result in &report.results {
            self.emit(
                session_id,
                EventKind::VerificationResult {
                    checker: result.checker.clone(),
                    passed: result.passed,
                    score: result.score,
                    blocking_findings: result.blocking_findings().count(),
                    mode: report.mode,
                },
            );
        }
    }

    /// Live event stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Past events for one session
    #[must_use]
    pub fn history(&self, session_id: SessionId) -> Vec<ProgressEvent> {
        self.history
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_are_human() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(185)), "3m 5s");
        assert_eq!(format_duration(Duration::from_secs(2 * 3600 + 600)), "2h 10m");
        assert_eq!(format_duration(Duration::from_secs(86_400 + 4 * 3600)), "1d 4h");
    }

    #[tokio::test]
    async fn subscribers_and_history_see_events() {
        let channel = ProgressChannel::new();
        let mut rx = channel.subscribe();
        let session = SessionId::new();
        channel.emit(session, EventKind::ComponentsPartitioned { count: 3 });
        channel.emit(SessionId::new(), EventKind::ComponentsPartitioned { count: 1 });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ComponentsPartitioned { count: 3 });
        assert_eq!(channel.history(session).len(), 1);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(EventKind::BudgetExceeded {
            budget: BudgetKind::Cost,
        })
        .unwrap();
        assert_eq!(json["type"], "budget_exceeded");
        assert_eq!(json["budget"], "cost");
    }
}
