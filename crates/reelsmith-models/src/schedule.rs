//! Publish schedules.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::{JobId, JobInputs};

/// Identifier of a publish schedule.
///
/// Derived from the job id so that scheduling the same job twice resolves to
/// the same schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ScheduleId(pub String);

impl ScheduleId {
    /// Schedule id for a job.
    pub fn for_job(job_id: &JobId) -> Self {
        Self(format!("pub-{}", job_id))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Schedule lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    #[default]
    Scheduled,
    Published,
    Failed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Scheduled => "scheduled",
            ScheduleStatus::Published => "published",
            ScheduleStatus::Failed => "failed",
            ScheduleStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScheduleStatus::Scheduled)
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Video visibility on the external platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Unlisted,
    Private,
}

/// Metadata sent along with an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PublishMetadata {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub visibility: Visibility,
}

impl PublishMetadata {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            tags: Vec::new(),
            visibility: Visibility::default(),
        }
    }

    /// Default metadata derived from the job inputs.
    pub fn from_inputs(inputs: &JobInputs) -> Self {
        Self {
            title: inputs.topic.clone(),
            description: String::new(),
            tags: vec![inputs.style.clone()],
            visibility: Visibility::default(),
        }
    }
}

/// A planned upload of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PublishSchedule {
    pub id: ScheduleId,
    pub job_id: JobId,
    pub channel_id: String,
    /// When the upload becomes due
    pub publish_at: DateTime<Utc>,
    #[serde(default)]
    pub status: ScheduleStatus,
    /// Consecutive failed publish attempts
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_url: Option<String>,
    pub metadata: PublishMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PublishSchedule {
    pub fn new(
        job_id: JobId,
        channel_id: impl Into<String>,
        publish_at: DateTime<Utc>,
        metadata: PublishMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ScheduleId::for_job(&job_id),
            job_id,
            channel_id: channel_id.into(),
            publish_at,
            status: ScheduleStatus::Scheduled,
            retry_count: 0,
            last_error: None,
            published_url: None,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_published(&mut self, url: impl Into<String>) {
        self.status = ScheduleStatus::Published;
        self.published_url = Some(url.into());
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt and return the new retry count.
    pub fn record_failure(&mut self, error: impl Into<String>) -> u32 {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
        self.retry_count
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = ScheduleStatus::Failed;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    pub fn cancel(&mut self) {
        self.status = ScheduleStatus::Cancelled;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_id_is_stable_per_job() {
        let job_id = JobId::from_string("abc");
        assert_eq!(ScheduleId::for_job(&job_id), ScheduleId::for_job(&job_id));
        assert_eq!(ScheduleId::for_job(&job_id).as_str(), "pub-abc");
    }

    #[test]
    fn test_failure_then_publish() {
        let mut schedule = PublishSchedule::new(
            JobId::from_string("abc"),
            "C1",
            Utc::now(),
            PublishMetadata::new("Title"),
        );
        assert_eq!(schedule.record_failure("quota"), 1);
        assert_eq!(schedule.record_failure("quota"), 2);
        assert!(!schedule.status.is_terminal());

        schedule.mark_published("https://example.com/v/1");
        assert_eq!(schedule.status, ScheduleStatus::Published);
        assert!(schedule.last_error.is_none());
        assert!(schedule.status.is_terminal());
    }
}
