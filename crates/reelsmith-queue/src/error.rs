//! Queue error types.

use reelsmith_store::StoreError;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("A batch is already being processed")]
    AlreadyProcessing,

    #[error("Invalid queue entry: {0}")]
    InvalidEntry(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn invalid_entry(msg: impl Into<String>) -> Self {
        Self::InvalidEntry(msg.into())
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Store(e) => e.is_transient(),
            QueueError::AlreadyProcessing => true,
            _ => false,
        }
    }
}
