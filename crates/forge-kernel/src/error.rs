use std::fmt::Debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal {machine} transition: {from} -> {to}")]
    Illegal {
        machine: &'static str,
        from: String,
        to: String,
    },
    #[error("{machine} is already terminal in {state}")]
    AlreadyTerminal { machine: &'static str, state: String },
}

impl TransitionError {
    pub(crate) fn illegal(machine: &'static str, from: impl Debug, to: impl Debug) -> Self {
        Self::Illegal {
            machine,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("self loop on {0}")]
    SelfLoop(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("audit log integrity violation at entry {0}")]
    IntegrityViolation(u64),
}
