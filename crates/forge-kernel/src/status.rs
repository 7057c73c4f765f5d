use crate::error::TransitionError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Building,
    Escalating,
    /// Ladder exhausted; waits for a contract amendment or operator action.
    PausedNeedsInput,
    Aborted,
    Completed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Aborted | SessionStatus::Completed)
    }

    pub fn allowed_transitions(self) -> Vec<SessionStatus> {
        use SessionStatus::*;
        match self {
            Building => vec![Escalating, PausedNeedsInput, Aborted, Completed],
            Escalating => vec![Building, PausedNeedsInput, Aborted],
            PausedNeedsInput => vec![Building, Aborted],
            Aborted | Completed => vec![],
        }
    }

    pub fn validate_transition(self, to: SessionStatus) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                machine: "session",
                state: format!("{self:?}"),
            });
        }
        if self.allowed_transitions().contains(&to) {
            Ok(())
        } else {
            Err(TransitionError::illegal("session", self, to))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Pending,
    Building,
    Verifying,
    Merged,
    Failed,
}

impl ComponentStatus {
    pub fn allowed_transitions(self) -> Vec<ComponentStatus> {
        use ComponentStatus::*;
        match self {
            Pending => vec![Building],
            Building => vec![Verifying, Failed],
            // Merge conflicts and advisory findings send a component back
            Verifying => vec![Merged, Building, Failed],
            // Gap-targeted and escalation rebuilds
            Merged => vec![Building],
            Failed => vec![Building],
        }
    }

    pub fn validate_transition(self, to: ComponentStatus) -> Result<(), TransitionError> {
        if self.allowed_transitions().contains(&to) {
            Ok(())
        } else {
            Err(TransitionError::illegal("component", self, to))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_reject_everything() {
        for terminal in [SessionStatus::Aborted, SessionStatus::Completed] {
            for to in [
                SessionStatus::Building,
                SessionStatus::Escalating,
                SessionStatus::PausedNeedsInput,
                SessionStatus::Aborted,
                SessionStatus::Completed,
            ] {
                assert!(terminal.validate_transition(to).is_err());
            }
        }
    }

    #[test]
    fn paused_never_completes_directly() {
        assert!(SessionStatus::PausedNeedsInput
            .validate_transition(SessionStatus::Completed)
            .is_err());
        assert!(SessionStatus::Escalating
            .validate_transition(SessionStatus::Completed)
            .is_err());
        assert!(SessionStatus::PausedNeedsInput
            .validate_transition(SessionStatus::Building)
            .is_ok());
    }

    #[test]
    fn component_lifecycle() {
        use ComponentStatus::*;
        for (from, to) in [(Pending, Building), (Building, Verifying), (Verifying, Merged), (Merged, Building)] {
            assert!(from.validate_transition(to).is_ok(), "{from:?} -> {to:?}");
        }
        assert!(Pending.validate_transition(Merged).is_err());
        assert!(Building.validate_transition(Merged).is_err());
    }

    #[test]
    fn kebab_case_on_the_wire() {
        let json = serde_json::to_string(&SessionStatus::PausedNeedsInput).unwrap();
        assert_eq!(json, "\"paused-needs-input\"");
    }
}
