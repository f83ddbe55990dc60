//! Model error types.

use thiserror::Error;

use crate::job::{PipelineStep, Stage};

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid job inputs: {0}")]
    InvalidInputs(String),

    #[error("Stage {step} cannot be recorded while job is at stage {stage}")]
    OutOfOrder { step: PipelineStep, stage: Stage },

    #[error("Output does not match step {0}")]
    OutputMismatch(PipelineStep),

    #[error("Job is not ready to publish: {0}")]
    NotPublishable(String),
}

impl ModelError {
    pub fn invalid_inputs(msg: impl Into<String>) -> Self {
        Self::InvalidInputs(msg.into())
    }

    pub fn not_publishable(msg: impl Into<String>) -> Self {
        Self::NotPublishable(msg.into())
    }
}
