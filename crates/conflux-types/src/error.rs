use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from repository operations (used by trait definitions in conflux-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

// ---------------------------------------------------------------------------
// Step failures
// ---------------------------------------------------------------------------

/// Classification of a failed step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error, 5xx, or unresolvable target. Retried; feeds the breaker.
    Transient,
    /// The call or wait exceeded its deadline.
    Timeout,
    /// The target rejected the request or the response was unusable.
    Permanent,
    /// The target's circuit breaker refused the call without touching the network.
    CircuitOpen,
    /// Cooperative abort.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Transient => "transient",
            FailureKind::Timeout => "timeout",
            FailureKind::Permanent => "permanent",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The error half of a step attempt outcome, as recorded in the state log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Earliest useful retry, when the failure carries one (open breaker).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "aborted by cancellation")
    }

    pub fn circuit_open(target: &str, retry_after_ms: u64) -> Self {
        Self {
            kind: FailureKind::CircuitOpen,
            message: format!("circuit open for target '{target}'"),
            retry_after_ms: Some(retry_after_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_step_failure_display() {
        let err = StepFailure::transient("connection refused");
        assert_eq!(err.to_string(), "transient: connection refused");

        let err = StepFailure::circuit_open("billing", 1500);
        assert!(err.to_string().starts_with("circuit_open"));
        assert_eq!(err.retry_after_ms, Some(1500));
    }

    #[test]
    fn test_failure_kind_serde() {
        let json = serde_json::to_string(&FailureKind::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
    }
}
