//! Structured error taxonomy for the orchestration engine: the closed
//! `StageErrorKind` set stages are allowed to report, plus the handful of
//! error types the boundary and internal code can produce.

use crate::model::StepName;
use thiserror::Error;

/// The closed set of error kinds a `Stage` may tag a failure with. The
/// orchestrator's retry/fatal/skip decision is derived entirely from this
/// tag and the step's policy — it never inspects the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageErrorKind {
    Timeout,
    Connection,
    Temporary,
    RateLimit,
    InvalidInput,
    Internal,
    Unavailable,
}

impl StageErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageErrorKind::Timeout => "timeout",
            StageErrorKind::Connection => "connection",
            StageErrorKind::Temporary => "temporary",
            StageErrorKind::RateLimit => "rate_limit",
            StageErrorKind::InvalidInput => "invalid_input",
            StageErrorKind::Internal => "internal",
            StageErrorKind::Unavailable => "unavailable",
        }
    }

    /// Whether this kind belongs to the transient-error set consulted by
    /// `PolicyRegistry::should_retry` for `RetryPolicy::Exponential` steps:
    /// timeout, connection, temporary, rate_limit.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StageErrorKind::Timeout
                | StageErrorKind::Connection
                | StageErrorKind::Temporary
                | StageErrorKind::RateLimit
        )
    }
}

impl std::fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The structured result a `Stage` returns on failure. Stages never panic
/// or throw into the orchestrator — this is the only failure channel.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Internal, message)
    }
}

/// Errors produced by the Policy Registry while deriving or validating a
/// per-request configuration. Carried as a `Vec<String>` at the call site
/// (`validate_overrides` returns the full list of problems at once); this
/// type wraps that list for places that need a single `std::error::Error`.
#[derive(Debug, Error)]
#[error("invalid policy overrides: {}", .0.join("; "))]
pub struct PolicyError(pub Vec<String>);

/// Top-level errors from the orchestrator's own code (never from a stage —
/// those are `StageError`s consumed internally and folded into the step
/// graph): validation failures, an unknown request id, a step with no
/// registered handler, or an internal invariant violation.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(#[from] PolicyError),

    #[error("unknown request id")]
    UnknownRequest,

    #[error("step {0} has no registered stage and is not skippable")]
    NoHandler(StepName),

    #[error("internal orchestrator error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_and_rate_limit_kinds_are_transient() {
        assert!(StageErrorKind::Timeout.is_transient());
        assert!(StageErrorKind::Connection.is_transient());
        assert!(StageErrorKind::Temporary.is_transient());
        assert!(StageErrorKind::RateLimit.is_transient());
        assert!(!StageErrorKind::InvalidInput.is_transient());
        assert!(!StageErrorKind::Internal.is_transient());
        assert!(!StageErrorKind::Unavailable.is_transient());
    }

    #[test]
    fn stage_error_display() {
        let err = StageError::new(StageErrorKind::Timeout, "deadline elapsed");
        assert_eq!(err.to_string(), "timeout: deadline elapsed");
    }

    #[test]
    fn policy_error_joins_messages() {
        let err = PolicyError(vec!["bad key".to_string(), "out of range".to_string()]);
        assert_eq!(err.to_string(), "invalid policy overrides: bad key; out of range");
    }
}
