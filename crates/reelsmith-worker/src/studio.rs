//! Collaborator interfaces for content production, publishing and
//! notifications.
//!
//! Implementations report failures through [`WorkerError`]: quota, network
//! and auth trouble as `Transient`, rejected input as `Permanent`.
//!
//! [`WorkerError`]: crate::error::WorkerError

use async_trait::async_trait;
use reelsmith_models::{JobInputs, PublishMetadata, Severity};

use crate::error::WorkerResult;

/// The five production stages.
#[async_trait]
pub trait ContentStudio: Send + Sync {
    /// Write the narration script.
    async fn generate_script(&self, inputs: &JobInputs) -> WorkerResult<String>;

    /// Synthesize narration; returns the audio URI.
    async fn generate_narration(&self, script: &str, voice: Option<&str>) -> WorkerResult<String>;

    /// Produce visuals for the script; returns image or clip URIs.
    async fn generate_visuals(&self, script: &str, inputs: &JobInputs) -> WorkerResult<Vec<String>>;

    /// Render the final video; returns its URI.
    async fn assemble_video(
        &self,
        audio: &str,
        visuals: &[String],
        inputs: &JobInputs,
    ) -> WorkerResult<String>;

    /// Render a thumbnail for the video; returns its URI.
    async fn generate_thumbnail(&self, video: &str, inputs: &JobInputs) -> WorkerResult<String>;
}

/// Upload to the external platform.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Upload `video` to `channel_id`; returns the public URL.
    async fn publish(
        &self,
        video: &str,
        channel_id: &str,
        metadata: &PublishMetadata,
    ) -> WorkerResult<String>;
}

/// Fire-and-forget operator notifications. Delivery failures are swallowed.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, severity: Severity, message: &str);
}
