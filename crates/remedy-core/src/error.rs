use thiserror::Error;

/// Failure of a call to the external reasoning collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReasoningError {
    #[error("{stage} stage timed out after {timeout_ms}ms")]
    Timeout { stage: String, timeout_ms: u64 },

    #[error("Malformed reasoning response: {0}")]
    Malformed(String),

    #[error("Reasoning service unavailable: {0}")]
    Unavailable(String),

    #[error("Reasoning service internal error: {0}")]
    Internal(String),
}

/// Failure of a call to the system that applies actions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TargetError {
    #[error("Transient target failure: {0}")]
    Transient(String),

    #[error("Target call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Target not found: {0}")]
    NotFound(String),

    #[error("Target rejected action: {0}")]
    Rejected(String),
}

impl TargetError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }
}

/// Failure to read the current state of a target.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObserveError {
    #[error("Observed-state source unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed observed state: {0}")]
    Malformed(String),
}
