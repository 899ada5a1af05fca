//! Queue error model.

use thiserror::Error;

use crate::id::JobId;

/// Result type used across the queue.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// Producer-facing variants (`Validation`, `NotFound`, `InvalidState`) are
/// returned synchronously to callers. `UnknownType` is raised by the handler
/// registry and converted into a permanent job failure by the worker.
/// `StoreUnavailable` is the only transient variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Enqueue input was rejected; no job was created.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No job exists with this id.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The requested transition is not legal from the job's current status.
    #[error("cannot {action} job {id} in status '{status}'")]
    InvalidState {
        id: JobId,
        status: String,
        action: &'static str,
    },

    /// No handler is registered for the job type.
    #[error("no handler registered for job type '{0}'")]
    UnknownType(String),

    /// The persistence layer could not be reached or failed transiently.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_state(id: JobId, status: impl Into<String>, action: &'static str) -> Self {
        Self::InvalidState {
            id,
            status: status.into(),
            action,
        }
    }

    pub fn unknown_type(job_type: impl Into<String>) -> Self {
        Self::UnknownType(job_type.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_errors_are_transient() {
        assert!(QueueError::store_unavailable("connection refused").is_transient());
        assert!(!QueueError::validation("empty job_type").is_transient());
        assert!(!QueueError::NotFound(JobId::new(7)).is_transient());
        assert!(!QueueError::unknown_type("send_fax").is_transient());
    }

    #[test]
    fn invalid_state_message_names_action_and_status() {
        let err = QueueError::invalid_state(JobId::new(3), "processing", "cancel");
        assert_eq!(err.to_string(), "cannot cancel job 3 in status 'processing'");
    }
}
