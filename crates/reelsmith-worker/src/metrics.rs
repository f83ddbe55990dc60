//! Pipeline and trigger metrics.

use metrics::{counter, gauge, histogram};
use reelsmith_models::PipelineStep;

/// Metric names as constants for consistency.
pub mod names {
    // Pipeline
    pub const STAGES_TOTAL: &str = "reelsmith_stages_total";
    pub const STAGE_DURATION_SECONDS: &str = "reelsmith_stage_duration_seconds";
    pub const JOBS_SUBMITTED_TOTAL: &str = "reelsmith_jobs_submitted_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "reelsmith_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "reelsmith_jobs_failed_total";
    pub const PUBLISHED_TOTAL: &str = "reelsmith_published_total";

    // Retry executor
    pub const RETRIES_TOTAL: &str = "reelsmith_retries_total";
    pub const RETRIES_EXHAUSTED_TOTAL: &str = "reelsmith_retries_exhausted_total";

    // Triggers and queues
    pub const TRIGGER_ENTRIES_TOTAL: &str = "reelsmith_trigger_entries_total";
    pub const TRIGGER_DURATION_SECONDS: &str = "reelsmith_trigger_duration_seconds";
    pub const TRIGGER_BUDGET_EXHAUSTED_TOTAL: &str = "reelsmith_trigger_budget_exhausted_total";
    pub const QUEUE_LENGTH: &str = "reelsmith_queue_length";
    pub const QUEUE_DEAD_LETTER_LENGTH: &str = "reelsmith_queue_dead_letter_length";
}

pub fn record_stage(step: PipelineStep, success: bool, duration_secs: f64) {
    let labels = [
        ("step", step.as_str().to_string()),
        ("outcome", if success { "success" } else { "failure" }.to_string()),
    ];
    counter!(names::STAGES_TOTAL, &labels).increment(1);
    histogram!(names::STAGE_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_job_submitted() {
    counter!(names::JOBS_SUBMITTED_TOTAL).increment(1);
}

pub fn record_job_completed() {
    counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
}

pub fn record_job_failed() {
    counter!(names::JOBS_FAILED_TOTAL).increment(1);
}

pub fn record_published() {
    counter!(names::PUBLISHED_TOTAL).increment(1);
}

pub fn record_retry(operation: &str) {
    let labels = [("operation", operation.to_string())];
    counter!(names::RETRIES_TOTAL, &labels).increment(1);
}

pub fn record_retries_exhausted(operation: &str) {
    let labels = [("operation", operation.to_string())];
    counter!(names::RETRIES_EXHAUSTED_TOTAL, &labels).increment(1);
}

pub fn record_trigger_entry(queue: &str, outcome: &str) {
    let labels = [
        ("queue", queue.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!(names::TRIGGER_ENTRIES_TOTAL, &labels).increment(1);
}

pub fn record_trigger(queue: &str, budget_exhausted: bool, duration_secs: f64) {
    let labels = [("queue", queue.to_string())];
    histogram!(names::TRIGGER_DURATION_SECONDS, &labels).record(duration_secs);
    if budget_exhausted {
        counter!(names::TRIGGER_BUDGET_EXHAUSTED_TOTAL, &labels).increment(1);
    }
}

pub fn set_queue_lengths(queue: &str, length: u64, dead_lettered: u64) {
    let labels = [("queue", queue.to_string())];
    gauge!(names::QUEUE_LENGTH, &labels).set(length as f64);
    gauge!(names::QUEUE_DEAD_LETTER_LENGTH, &labels).set(dead_lettered as f64);
}
