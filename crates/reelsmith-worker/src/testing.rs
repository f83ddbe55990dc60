//! Scripted collaborators for tests.
//!
//! [`ScriptedStudio`] answers every stage and the publisher with canned
//! artifacts, fails named operations a set number of times and counts every
//! call. [`RecordingNotifier`] keeps what it was asked to send.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reelsmith_models::{JobInputs, PublishMetadata, Severity};
use tokio::sync::Mutex;

use crate::error::{WorkerError, WorkerResult};
use crate::studio::{ContentStudio, Notifier, Publisher};

/// Operation names: the stage names plus `"publish"`.
#[derive(Default)]
pub struct ScriptedStudio {
    transient: Mutex<HashMap<String, u32>>,
    permanent: HashSet<String>,
    calls: Mutex<HashMap<String, u32>>,
    delay: Duration,
}

impl ScriptedStudio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `operation` with a transient error for its next `times` calls.
    pub fn with_failures(mut self, operation: &str, times: u32) -> Self {
        self.transient
            .get_mut()
            .insert(operation.to_string(), times);
        self
    }

    /// Fail every call to `operation` with a permanent error.
    pub fn with_permanent_failure(mut self, operation: &str) -> Self {
        self.permanent.insert(operation.to_string());
        self
    }

    /// Time every call takes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Transient failures for `operation` from now on.
    pub async fn fail_next(&self, operation: &str, times: u32) {
        self.transient
            .lock()
            .await
            .insert(operation.to_string(), times);
    }

    pub async fn calls(&self, operation: &str) -> u32 {
        self.calls
            .lock()
            .await
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    async fn call(&self, operation: &str) -> WorkerResult<u32> {
        let n = {
            let mut calls = self.calls.lock().await;
            let n = calls.entry(operation.to_string()).or_insert(0);
            *n += 1;
            *n
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.permanent.contains(operation) {
            return Err(WorkerError::permanent(format!("{} rejected", operation)));
        }
        let mut plan = self.transient.lock().await;
        if let Some(remaining) = plan.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(WorkerError::transient(format!("{} unavailable", operation)));
            }
        }
        Ok(n)
    }
}

#[async_trait]
impl ContentStudio for ScriptedStudio {
    async fn generate_script(&self, inputs: &JobInputs) -> WorkerResult<String> {
        self.call("script").await?;
        Ok(format!("A short film about {}", inputs.topic))
    }

    async fn generate_narration(&self, _script: &str, voice: Option<&str>) -> WorkerResult<String> {
        let n = self.call("narration").await?;
        Ok(format!("mem://audio/{}/{}", voice.unwrap_or("default"), n))
    }

    async fn generate_visuals(&self, _script: &str, _inputs: &JobInputs) -> WorkerResult<Vec<String>> {
        let n = self.call("visuals").await?;
        Ok(vec![format!("mem://image/{}/0", n), format!("mem://image/{}/1", n)])
    }

    async fn assemble_video(
        &self,
        _audio: &str,
        visuals: &[String],
        _inputs: &JobInputs,
    ) -> WorkerResult<String> {
        let n = self.call("assembly").await?;
        Ok(format!("mem://video/{}?frames={}", n, visuals.len()))
    }

    async fn generate_thumbnail(&self, _video: &str, _inputs: &JobInputs) -> WorkerResult<String> {
        let n = self.call("thumbnail").await?;
        Ok(format!("mem://thumbnail/{}", n))
    }
}

#[async_trait]
impl Publisher for ScriptedStudio {
    async fn publish(
        &self,
        _video: &str,
        channel_id: &str,
        _metadata: &PublishMetadata,
    ) -> WorkerResult<String> {
        let n = self.call("publish").await?;
        Ok(format!("https://videos.example.com/{}/{}", channel_id, n))
    }
}

/// Keeps every notification in order.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Severity, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<(Severity, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        self.sent.lock().await.push((severity, message.to_string()));
    }
}
