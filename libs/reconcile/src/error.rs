//! Error types and the per-pass error aggregator.

use thiserror::Error;
use tracing::warn;

/// Reconciliation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// The dataplane or the store could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// Reading or writing a correlation snapshot failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A desired object is malformed.
    #[error("invalid {name}: {reason}")]
    Validation { name: String, reason: String },

    /// The forwarder refused the requested state.
    #[error("dataplane rejected {name}: {reason}")]
    Rejected { name: String, reason: String },

    /// Resource not found.
    #[error("resource not found: {0}")]
    NotFound(String),
}

impl ReconcileError {
    /// Build a validation error for the named object.
    pub fn validation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Build a rejection error for the named object.
    pub fn rejected(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error is fatal for a whole pass.
    pub fn is_pass_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Persistence(_))
    }
}

/// Collects per-object failures during a pass without interrupting it.
///
/// The pass outcome is the most recently recorded error; callers that need
/// every failure read the logs.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    failures: usize,
    last: Option<ReconcileError>,
}

impl ErrorAggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one object operation.
    ///
    /// Returns true if the operation succeeded.
    pub fn record<T>(&mut self, object: &str, result: Result<T, ReconcileError>) -> bool {
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(object = %object, error = %e, "Object operation failed");
                self.push(e);
                false
            }
        }
    }

    /// Record an error that was already logged by the caller.
    pub fn push(&mut self, error: ReconcileError) {
        self.failures += 1;
        self.last = Some(error);
    }

    /// Number of failures recorded so far.
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// The most recent failure, if any.
    pub fn last_error(&self) -> Option<&ReconcileError> {
        self.last.as_ref()
    }

    /// Close the pass.
    pub fn finish(self) -> Result<(), ReconcileError> {
        match self.last {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
