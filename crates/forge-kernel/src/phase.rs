use crate::error::TransitionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Build phases, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    IntentLock,
    Init,
    ParallelBuild,
    Integration,
    FunctionalTest,
    IntentSatisfaction,
    Verification,
    Demo,
    Deploy,
    LearningCapture,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Forward,
    /// One of the explicit failure loops.
    Backward,
    /// Straight to TERMINAL from anywhere.
    Abort,
    /// Restart a reloaded or amended session from INIT.
    Resume,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::IntentLock,
        Phase::Init,
        Phase::ParallelBuild,
        Phase::Integration,
        Phase::FunctionalTest,
        Phase::IntentSatisfaction,
        Phase::Verification,
        Phase::Demo,
        Phase::Deploy,
        Phase::LearningCapture,
        Phase::Terminal,
    ];

    pub fn is_terminal(self) -> bool {
        self == Phase::Terminal
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::IntentLock => "INTENT_LOCK",
            Phase::Init => "INIT",
            Phase::ParallelBuild => "PARALLEL_BUILD",
            Phase::Integration => "INTEGRATION",
            Phase::FunctionalTest => "FUNCTIONAL_TEST",
            Phase::IntentSatisfaction => "INTENT_SATISFACTION",
            Phase::Verification => "VERIFICATION",
            Phase::Demo => "DEMO",
            Phase::Deploy => "DEPLOY",
            Phase::LearningCapture => "LEARNING_CAPTURE",
            Phase::Terminal => "TERMINAL",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn forward_transitions(from: Phase) -> Vec<Phase> {
    use Phase::*;
    match from {
        IntentLock => vec![Init],
        Init => vec![ParallelBuild],
        ParallelBuild => vec![Integration],
        Integration => vec![FunctionalTest],
        FunctionalTest => vec![IntentSatisfaction],
        IntentSatisfaction => vec![Verification],
        Verification => vec![Demo],
        // DEPLOY is optional
        Demo => vec![Deploy, LearningCapture],
        Deploy => vec![LearningCapture],
        LearningCapture => vec![Terminal],
        Terminal => vec![],
    }
}

pub fn backward_transitions(from: Phase) -> Vec<Phase> {
    use Phase::*;
    match from {
        Integration => vec![ParallelBuild],
        FunctionalTest => vec![ParallelBuild, Integration],
        IntentSatisfaction => vec![ParallelBuild],
        Verification => vec![ParallelBuild, Integration],
        _ => vec![],
    }
}

/// Classify `from -> to`, or `None` if the edge does not exist.
pub fn classify(from: Phase, to: Phase) -> Option<TransitionKind> {
    if from.is_terminal() {
        return None;
    }
    if forward_transitions(from).contains(&to) {
        Some(TransitionKind::Forward)
    } else if backward_transitions(from).contains(&to) {
        Some(TransitionKind::Backward)
    } else if to == Phase::Terminal {
        Some(TransitionKind::Abort)
    } else if to == Phase::Init && from > Phase::Init {
        Some(TransitionKind::Resume)
    } else {
        None
    }
}

pub fn validate_transition(from: Phase, to: Phase) -> Result<TransitionKind, TransitionError> {
    if from.is_terminal() {
        return Err(TransitionError::AlreadyTerminal {
            machine: "phase",
            state: from.to_string(),
        });
    }
    classify(from, to).ok_or_else(|| TransitionError::illegal("phase", from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn happy_path_is_forward() {
        let path = [
            Phase::IntentLock,
            Phase::Init,
            Phase::ParallelBuild,
            Phase::Integration,
            Phase::FunctionalTest,
            Phase::IntentSatisfaction,
            Phase::Verification,
            Phase::Demo,
            Phase::LearningCapture,
            Phase::Terminal,
        ];
        for pair in path.windows(2) {
            assert_eq!(validate_transition(pair[0], pair[1]), Ok(TransitionKind::Forward));
        }
    }

    #[test]
    fn deploy_is_optional() {
        assert_eq!(classify(Phase::Demo, Phase::Deploy), Some(TransitionKind::Forward));
        assert_eq!(classify(Phase::Deploy, Phase::LearningCapture), Some(TransitionKind::Forward));
    }

    #[test]
    fn backward_edges_are_explicit() {
        assert_eq!(
            classify(Phase::FunctionalTest, Phase::ParallelBuild),
            Some(TransitionKind::Backward)
        );
        assert_eq!(
            classify(Phase::IntentSatisfaction, Phase::ParallelBuild),
            Some(TransitionKind::Backward)
        );
        assert_eq!(classify(Phase::Verification, Phase::Integration), Some(TransitionKind::Backward));
        assert_eq!(classify(Phase::Demo, Phase::ParallelBuild), None);
        assert_eq!(classify(Phase::LearningCapture, Phase::Verification), None);
    }

    #[test]
    fn skipping_ahead_is_illegal() {
        assert!(validate_transition(Phase::Init, Phase::Verification).is_err());
        assert!(validate_transition(Phase::ParallelBuild, Phase::Demo).is_err());
    }

    #[test]
    fn terminal_is_final() {
        assert!(matches!(
            validate_transition(Phase::Terminal, Phase::Init),
            Err(TransitionError::AlreadyTerminal { .. })
        ));
    }

    #[test]
    fn serde_uses_screaming_case() {
        let json = serde_json::to_string(&Phase::ParallelBuild).unwrap();
        assert_eq!(json, "\"PARALLEL_BUILD\"");
    }

    proptest! {
        #[test]
        fn only_listed_edges_move_backward(from in 0usize..11, to in 0usize..11) {
            let (from, to) = (Phase::ALL[from], Phase::ALL[to]);
            if let Some(kind) = classify(from, to) {
                if to < from {
                    prop_assert!(matches!(kind, TransitionKind::Backward | TransitionKind::Resume));
                }
                if kind == TransitionKind::Forward {
                    prop_assert!(to > from);
                }
            }
        }
    }
}
