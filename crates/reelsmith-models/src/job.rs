//! Job records for the content pipeline.
//!
//! A [`JobRecord`] is the durable checkpoint of one pipeline run. The
//! `stage` field and the `artifacts` slots move together: every step that
//! succeeds writes its artifact and advances the stage in the same update,
//! so a record loaded after a crash tells the orchestrator exactly which
//! steps remain.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;
use validator::Validate;

use crate::error::{ModelError, ModelResult};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stage a job has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Submitted, nothing produced yet
    #[default]
    Pending,
    ScriptGenerated,
    AudioGenerated,
    VisualsGenerated,
    VideoCreated,
    /// All production steps done (thumbnail included)
    Completed,
    /// Uploaded to the external platform
    Published,
    /// Terminal failure; only an explicit reopen leaves this state
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::ScriptGenerated => "script_generated",
            Stage::AudioGenerated => "audio_generated",
            Stage::VisualsGenerated => "visuals_generated",
            Stage::VideoCreated => "video_created",
            Stage::Completed => "completed",
            Stage::Published => "published",
            Stage::Failed => "failed",
        }
    }

    /// Position in production order. `Failed` has no position.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Stage::Pending => Some(0),
            Stage::ScriptGenerated => Some(1),
            Stage::AudioGenerated => Some(2),
            Stage::VisualsGenerated => Some(3),
            Stage::VideoCreated => Some(4),
            Stage::Completed => Some(5),
            Stage::Published => Some(6),
            Stage::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Published | Stage::Failed)
    }

    /// Whether every production step has run.
    pub fn is_produced(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Published)
    }

    /// The furthest stage the given artifacts account for.
    ///
    /// Used when a failed job is reopened: the artifacts survive, the stage
    /// does not, so the resume point is recomputed from what exists.
    pub fn from_artifacts(artifacts: &Artifacts) -> Stage {
        if artifacts.published_url.is_some() {
            Stage::Published
        } else if artifacts.thumbnail.is_some() {
            Stage::Completed
        } else if artifacts.video.is_some() {
            Stage::VideoCreated
        } else if artifacts.visuals.is_some() {
            Stage::VisualsGenerated
        } else if artifacts.audio.is_some() {
            Stage::AudioGenerated
        } else if artifacts.script.is_some() {
            Stage::ScriptGenerated
        } else {
            Stage::Pending
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One checkpointed production step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Script,
    Narration,
    Visuals,
    Assembly,
    Thumbnail,
}

impl PipelineStep {
    /// Steps in execution order.
    pub const ALL: [PipelineStep; 5] = [
        PipelineStep::Script,
        PipelineStep::Narration,
        PipelineStep::Visuals,
        PipelineStep::Assembly,
        PipelineStep::Thumbnail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Script => "script",
            PipelineStep::Narration => "narration",
            PipelineStep::Visuals => "visuals",
            PipelineStep::Assembly => "assembly",
            PipelineStep::Thumbnail => "thumbnail",
        }
    }

    /// Stage reached once this step has succeeded.
    pub fn completes(&self) -> Stage {
        match self {
            PipelineStep::Script => Stage::ScriptGenerated,
            PipelineStep::Narration => Stage::AudioGenerated,
            PipelineStep::Visuals => Stage::VisualsGenerated,
            PipelineStep::Assembly => Stage::VideoCreated,
            PipelineStep::Thumbnail => Stage::Completed,
        }
    }

    /// Stage a job must be at before this step may run.
    pub fn requires(&self) -> Stage {
        match self {
            PipelineStep::Script => Stage::Pending,
            PipelineStep::Narration => Stage::ScriptGenerated,
            PipelineStep::Visuals => Stage::AudioGenerated,
            PipelineStep::Assembly => Stage::VisualsGenerated,
            PipelineStep::Thumbnail => Stage::VideoCreated,
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    Script(String),
    Audio(String),
    Visuals(Vec<String>),
    Video(String),
    Thumbnail(String),
}

impl StepOutput {
    pub fn step(&self) -> PipelineStep {
        match self {
            StepOutput::Script(_) => PipelineStep::Script,
            StepOutput::Audio(_) => PipelineStep::Narration,
            StepOutput::Visuals(_) => PipelineStep::Visuals,
            StepOutput::Video(_) => PipelineStep::Assembly,
            StepOutput::Thumbnail(_) => PipelineStep::Thumbnail,
        }
    }
}

/// Resource references produced by the pipeline. Each slot is written once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Artifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visuals: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_url: Option<String>,
}

impl Artifacts {
    /// Whether the artifact for `step` exists.
    pub fn has(&self, step: PipelineStep) -> bool {
        match step {
            PipelineStep::Script => self.script.is_some(),
            PipelineStep::Narration => self.audio.is_some(),
            PipelineStep::Visuals => self.visuals.is_some(),
            PipelineStep::Assembly => self.video.is_some(),
            PipelineStep::Thumbnail => self.thumbnail.is_some(),
        }
    }

    /// Store a step output. Returns `false` and keeps the existing value if
    /// the slot is already occupied.
    pub fn insert(&mut self, output: StepOutput) -> bool {
        fn put<T>(slot: &mut Option<T>, value: T) -> bool {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        }

        match output {
            StepOutput::Script(v) => put(&mut self.script, v),
            StepOutput::Audio(v) => put(&mut self.audio, v),
            StepOutput::Visuals(v) => put(&mut self.visuals, v),
            StepOutput::Video(v) => put(&mut self.video, v),
            StepOutput::Thumbnail(v) => put(&mut self.thumbnail, v),
        }
    }

    pub fn is_published(&self) -> bool {
        self.published_url.is_some()
    }
}

fn default_style() -> String {
    "informative".to_string()
}

fn default_target_length() -> u32 {
    60
}

/// Parameters supplied at submission. Immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct JobInputs {
    /// Subject of the video
    #[validate(length(min = 1, max = 500))]
    pub topic: String,
    /// Narrative style hint for the script generator
    #[serde(default = "default_style")]
    #[validate(length(max = 64))]
    pub style: String,
    /// Target channel on the external platform
    #[validate(length(min = 1, max = 128))]
    pub channel_id: String,
    /// Desired video length
    #[serde(default = "default_target_length")]
    #[validate(range(min = 15, max = 3600))]
    pub target_length_secs: u32,
    /// Voice preset for narration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// Publish automatically at this time once production completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_at: Option<DateTime<Utc>>,
    /// Higher runs first within a batch
    #[serde(default)]
    pub priority: i32,
}

impl JobInputs {
    pub fn new(topic: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            style: default_style(),
            channel_id: channel_id.into(),
            target_length_secs: default_target_length(),
            voice: None,
            publish_at: None,
            priority: 0,
        }
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }

    pub fn with_target_length(mut self, secs: u32) -> Self {
        self.target_length_secs = secs;
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_publish_at(mut self, at: DateTime<Utc>) -> Self {
        self.publish_at = Some(at);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Validate field constraints.
    pub fn check(&self) -> ModelResult<()> {
        self.validate()
            .map_err(|e| ModelError::invalid_inputs(e.to_string()))?;
        if self.topic.trim().is_empty() {
            return Err(ModelError::invalid_inputs("topic must not be blank"));
        }
        Ok(())
    }
}

/// Durable state of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    /// Unique job ID
    pub id: JobId,

    /// Current stage
    #[serde(default)]
    pub stage: Stage,

    /// Submission parameters
    pub inputs: JobInputs,

    /// Produced resource references
    #[serde(default)]
    pub artifacts: Artifacts,

    /// Failed pipeline runs since submission or the last reopen
    #[serde(default)]
    pub attempt_count: u32,

    /// Executor attempts per step, summed across runs
    #[serde(default)]
    pub step_attempts: BTreeMap<PipelineStep, u32>,

    /// Error message of the last failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Step that produced `last_error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at_step: Option<PipelineStep>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a new pending record.
    pub fn new(inputs: JobInputs) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            stage: Stage::Pending,
            inputs,
            artifacts: Artifacts::default(),
            attempt_count: 0,
            step_attempts: BTreeMap::new(),
            last_error: None,
            failed_at_step: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn is_failed(&self) -> bool {
        self.stage == Stage::Failed
    }

    /// Steps strictly after the current stage, in execution order.
    pub fn pending_steps(&self) -> Vec<PipelineStep> {
        let Some(current) = self.stage.rank() else {
            return Vec::new();
        };

        PipelineStep::ALL
            .into_iter()
            .filter(|step| step.completes().rank().is_some_and(|r| r > current))
            .collect()
    }

    /// Executor attempts recorded for a step.
    pub fn attempts_for(&self, step: PipelineStep) -> u32 {
        self.step_attempts.get(&step).copied().unwrap_or(0)
    }

    /// Record a successful step: write its artifact and advance the stage.
    ///
    /// Returns whether the artifact slot was newly written.
    pub fn complete_step(&mut self, output: StepOutput, attempts: u32) -> ModelResult<bool> {
        let step = output.step();
        if self.stage != step.requires() {
            return Err(ModelError::OutOfOrder {
                step,
                stage: self.stage,
            });
        }

        let written = self.artifacts.insert(output);
        *self.step_attempts.entry(step).or_insert(0) += attempts;
        self.stage = step.completes();
        self.last_error = None;
        self.failed_at_step = None;
        self.touch();
        Ok(written)
    }

    /// Advance past a step whose artifact already exists without running it.
    pub fn adopt_existing(&mut self, step: PipelineStep) -> ModelResult<()> {
        if self.stage != step.requires() {
            return Err(ModelError::OutOfOrder {
                step,
                stage: self.stage,
            });
        }
        if !self.artifacts.has(step) {
            return Err(ModelError::OutputMismatch(step));
        }
        self.stage = step.completes();
        self.touch();
        Ok(())
    }

    /// Record a failed pipeline run. The stage does not move.
    pub fn record_failure(&mut self, step: PipelineStep, attempts: u32, error: impl Into<String>) {
        self.attempt_count += 1;
        *self.step_attempts.entry(step).or_insert(0) += attempts;
        self.last_error = Some(error.into());
        self.failed_at_step = Some(step);
        self.touch();
    }

    /// Move to the terminal failed state.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.stage = Stage::Failed;
        self.last_error = Some(error.into());
        self.touch();
    }

    /// Reopen a failed job. Artifacts are kept and the stage is recomputed
    /// from them. Returns `false` if the job was not failed.
    pub fn reopen(&mut self) -> bool {
        if self.stage != Stage::Failed {
            return false;
        }
        self.stage = Stage::from_artifacts(&self.artifacts);
        self.attempt_count = 0;
        self.last_error = None;
        self.failed_at_step = None;
        self.touch();
        true
    }

    /// The video reference to publish, if the job is ready for it.
    pub fn publishable_video(&self) -> ModelResult<&str> {
        if !self.stage.is_produced() {
            return Err(ModelError::not_publishable(format!(
                "job {} is at stage {}",
                self.id, self.stage
            )));
        }
        self.artifacts
            .video
            .as_deref()
            .ok_or_else(|| ModelError::not_publishable(format!("job {} has no video", self.id)))
    }

    /// Record the public URL. Returns `false` if already published.
    pub fn mark_published(&mut self, url: impl Into<String>) -> bool {
        if self.artifacts.is_published() {
            return false;
        }
        self.artifacts.published_url = Some(url.into());
        self.stage = Stage::Published;
        self.touch();
        true
    }

    /// Bump `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(JobInputs::new("Deep sea creatures", "C1"))
    }

    #[test]
    fn test_pending_steps_follow_stage() {
        let mut job = record();
        assert_eq!(job.pending_steps(), PipelineStep::ALL.to_vec());

        job.complete_step(StepOutput::Script("s".into()), 1).unwrap();
        job.complete_step(StepOutput::Audio("a.mp3".into()), 1).unwrap();
        assert_eq!(job.stage, Stage::AudioGenerated);
        assert_eq!(
            job.pending_steps(),
            vec![PipelineStep::Visuals, PipelineStep::Assembly, PipelineStep::Thumbnail]
        );

        job.mark_failed("boom");
        assert!(job.pending_steps().is_empty());
    }

    #[test]
    fn test_complete_step_rejects_out_of_order() {
        let mut job = record();
        let err = job
            .complete_step(StepOutput::Video("v.mp4".into()), 1)
            .unwrap_err();
        assert!(matches!(err, ModelError::OutOfOrder { step: PipelineStep::Assembly, .. }));
        assert_eq!(job.stage, Stage::Pending);
        assert!(job.artifacts.video.is_none());
    }

    #[test]
    fn test_artifacts_are_write_once() {
        let mut artifacts = Artifacts::default();
        assert!(artifacts.insert(StepOutput::Script("first".into())));
        assert!(!artifacts.insert(StepOutput::Script("second".into())));
        assert_eq!(artifacts.script.as_deref(), Some("first"));
    }

    #[test]
    fn test_step_attempts_accumulate_across_runs() {
        let mut job = record();
        job.complete_step(StepOutput::Script("s".into()), 1).unwrap();
        job.record_failure(PipelineStep::Narration, 3, "tts down");
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.stage, Stage::ScriptGenerated);

        job.complete_step(StepOutput::Audio("a.mp3".into()), 2).unwrap();
        assert_eq!(job.attempts_for(PipelineStep::Narration), 5);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_reopen_resumes_from_last_artifact() {
        let mut job = record();
        job.complete_step(StepOutput::Script("s".into()), 1).unwrap();
        job.complete_step(StepOutput::Audio("a.mp3".into()), 1).unwrap();
        job.record_failure(PipelineStep::Visuals, 3, "quota");
        job.mark_failed("gave up");

        assert!(job.reopen());
        assert_eq!(job.stage, Stage::AudioGenerated);
        assert_eq!(job.attempt_count, 0);
        assert!(job.last_error.is_none());
        assert_eq!(job.artifacts.audio.as_deref(), Some("a.mp3"));

        // Only failed jobs can be reopened
        assert!(!job.reopen());
    }

    #[test]
    fn test_publish_guard() {
        let mut job = record();
        assert!(job.publishable_video().is_err());

        for output in [
            StepOutput::Script("s".into()),
            StepOutput::Audio("a".into()),
            StepOutput::Visuals(vec!["v1".into()]),
            StepOutput::Video("video.mp4".into()),
            StepOutput::Thumbnail("t.png".into()),
        ] {
            job.complete_step(output, 1).unwrap();
        }
        assert_eq!(job.stage, Stage::Completed);
        assert_eq!(job.publishable_video().unwrap(), "video.mp4");

        assert!(job.mark_published("https://example.com/v/1"));
        assert!(!job.mark_published("https://example.com/v/2"));
        assert_eq!(
            job.artifacts.published_url.as_deref(),
            Some("https://example.com/v/1")
        );
        assert_eq!(job.stage, Stage::Published);
    }

    #[test]
    fn test_inputs_validation() {
        assert!(JobInputs::new("Topic", "C1").check().is_ok());
        assert!(JobInputs::new("", "C1").check().is_err());
        assert!(JobInputs::new("   ", "C1").check().is_err());
        assert!(JobInputs::new("Topic", "").check().is_err());
        assert!(JobInputs::new("Topic", "C1").with_target_length(5).check().is_err());
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::VisualsGenerated).unwrap();
        assert_eq!(json, "\"visuals_generated\"");

        let job = record();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["stage"], "pending");
        assert_eq!(value["inputs"]["channel_id"], "C1");
    }
}
