//! Shared data models for the Reelsmith pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Job records, pipeline stages and artifacts
//! - Publish schedules
//! - Queue entry outcomes and trigger summaries
//! - Notification severities

pub mod error;
pub mod job;
pub mod notification;
pub mod queue;
pub mod schedule;

// Re-export common types
pub use error::{ModelError, ModelResult};
pub use job::{Artifacts, JobId, JobInputs, JobRecord, PipelineStep, Stage, StepOutput};
pub use notification::Severity;
pub use queue::{EntryOutcome, EntryReport, TriggerSummary};
pub use schedule::{PublishMetadata, PublishSchedule, ScheduleId, ScheduleStatus, Visibility};
