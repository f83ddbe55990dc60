//! Structured job logging utilities.
//!
//! Consistent lifecycle logs for pipeline runs and publish attempts, keyed
//! by job id and operation.

use std::time::Duration;

use reelsmith_models::{JobId, PipelineStep};
use tracing::{error, info, warn, Span};

/// Job logger with the job id and operation attached to every line.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    operation: String,
}

impl JobLogger {
    /// Create a logger for a job and operation (e.g. "pipeline", "publish").
    pub fn new(job_id: &JobId, operation: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn from_string(job_id: &str, operation: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job progress: {}", message
        );
    }

    /// A stage succeeded and was checkpointed.
    pub fn log_stage(&self, step: PipelineStep, attempts: u32, elapsed: Duration) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            step = %step,
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "Stage completed"
        );
    }

    /// A stage was skipped because its artifact already exists.
    pub fn log_skip(&self, step: PipelineStep) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            step = %step,
            "Stage skipped, artifact present"
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Tracing span for this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            operation = %self.operation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_creation() {
        let job_id = JobId::new();
        let logger = JobLogger::new(&job_id, "pipeline");

        assert_eq!(logger.job_id(), job_id.to_string());
        assert_eq!(logger.operation(), "pipeline");
    }

    #[test]
    fn test_job_logger_from_string() {
        let logger = JobLogger::from_string("job-123", "publish");
        assert_eq!(logger.job_id(), "job-123");
        assert_eq!(logger.operation(), "publish");
    }
}
