//! Worker error types.
//!
//! Every error maps onto an [`ErrorKind`]. The retry executor retries
//! `Transient` errors only; the queue layer requeues everything except
//! `Permanent` errors, which are dead-lettered at once.

use reelsmith_models::ModelError;
use reelsmith_queue::QueueError;
use reelsmith_store::StoreError;
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, timeout, quota or store trouble; worth retrying
    Transient,
    /// Bad input or missing record; retrying cannot help
    Permanent,
    /// Wall-clock budget ran out; not a job failure
    BudgetExhausted,
    /// Retry ceiling reached on a transient error
    ExhaustedRetries,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::BudgetExhausted => "budget_exhausted",
            ErrorKind::ExhaustedRetries => "exhausted_retries",
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("{context} failed after {attempts} attempts: {source}")]
    ExhaustedRetries {
        context: String,
        attempts: u32,
        #[source]
        source: Box<WorkerError>,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<WorkerError>,
    },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl WorkerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Tag the error with the operation it came from.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Transient(_) => ErrorKind::Transient,
            WorkerError::Permanent(_) => ErrorKind::Permanent,
            WorkerError::BudgetExhausted(_) => ErrorKind::BudgetExhausted,
            WorkerError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            WorkerError::Context { source, .. } => source.kind(),
            WorkerError::JobNotFound(_)
            | WorkerError::ScheduleNotFound(_)
            | WorkerError::Conflict(_)
            | WorkerError::ConfigError(_)
            | WorkerError::Model(_) => ErrorKind::Permanent,
            WorkerError::Store(e) => {
                if e.is_transient() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            WorkerError::Queue(e) => {
                if e.is_transient() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
        }
    }

    /// Whether the retry executor should try again.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Whether the queue layer should give up on the entry at once.
    pub fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::Permanent
    }

    /// Whether a trigger was refused because another batch is running.
    pub fn is_already_processing(&self) -> bool {
        matches!(self, WorkerError::Queue(QueueError::AlreadyProcessing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_context() {
        let err = WorkerError::permanent("bad script").with_context("narration");
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(err.to_string(), "narration: Permanent failure: bad script");
    }

    #[test]
    fn test_store_errors_split_by_cause() {
        let down = WorkerError::from(StoreError::connection_failed("refused"));
        assert!(down.is_retryable());

        let missing = WorkerError::from(StoreError::not_found("job:1"));
        assert!(missing.is_permanent());
    }

    #[test]
    fn test_exhausted_retries_is_not_permanent() {
        let err = WorkerError::ExhaustedRetries {
            context: "narration".into(),
            attempts: 3,
            source: Box::new(WorkerError::transient("tts timeout")),
        };
        assert_eq!(err.kind(), ErrorKind::ExhaustedRetries);
        assert!(!err.is_retryable());
        assert!(!err.is_permanent());
        assert_eq!(
            err.to_string(),
            "narration failed after 3 attempts: Transient failure: tts timeout"
        );
    }

    #[test]
    fn test_already_processing_is_transient() {
        let err = WorkerError::from(QueueError::AlreadyProcessing);
        assert!(err.is_already_processing());
        assert!(err.is_retryable());
    }
}
