//! Domain error model.

use thiserror::Error;

/// A submission request failed shape validation.
///
/// Surfaced to clients as a client error; never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The job type was missing, empty or whitespace only.
    #[error("job type must not be empty")]
    EmptyType,

    /// The payload was absent or `null`.
    #[error("payload is required")]
    MissingPayload,

    /// The request body was not the expected JSON shape.
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl ValidationError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

/// Reason a single execution attempt failed.
///
/// This is an *expected* outcome: it drives the retry state machine and ends up
/// in the job's `last_error` column. It is never returned to HTTP callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct ExecutionFailure {
    reason: String,
}

impl ExecutionFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}
