//! HTTP implementations of the collaborator interfaces.
//!
//! [`HttpStudio`] talks JSON to a content gateway that fronts the AI and
//! rendering providers and the platform upload API. One endpoint per stage:
//!
//! | stage | endpoint | response field |
//! |---|---|---|
//! | script | `POST /v1/script` | `script` |
//! | narration | `POST /v1/narration` | `audio_url` |
//! | visuals | `POST /v1/visuals` | `visual_urls` |
//! | assembly | `POST /v1/assembly` | `video_url` |
//! | thumbnail | `POST /v1/thumbnail` | `thumbnail_url` |
//! | publish | `POST /v1/publish` | `url` |

use std::time::Duration;

use async_trait::async_trait;
use reelsmith_models::{JobInputs, PublishMetadata, Severity};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::studio::{ContentStudio, Notifier, Publisher};

/// Gateway client configuration.
#[derive(Debug, Clone)]
pub struct HttpStudioConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpStudioConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090".to_string(),
            api_key: None,
            timeout: Duration::from_secs(120),
        }
    }
}

impl HttpStudioConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("STUDIO_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8090".to_string()),
            api_key: std::env::var("STUDIO_API_KEY").ok().filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(
                std::env::var("STUDIO_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(120),
            ),
        }
    }
}

/// Map a non-success status onto the error taxonomy.
///
/// Throttling, timeouts, auth expiry and server faults are transient; other
/// client errors mean the request itself is wrong.
fn status_error(endpoint: &str, status: StatusCode, body: &str) -> WorkerError {
    let msg = format!("{} returned {}: {}", endpoint, status, body);
    match status {
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN => WorkerError::transient(msg),
        s if s.is_server_error() => WorkerError::transient(msg),
        _ => WorkerError::permanent(msg),
    }
}

#[derive(Debug, Deserialize)]
struct ScriptResponse {
    script: String,
}

#[derive(Debug, Deserialize)]
struct AudioResponse {
    audio_url: String,
}

#[derive(Debug, Deserialize)]
struct VisualsResponse {
    visual_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VideoResponse {
    video_url: String,
}

#[derive(Debug, Deserialize)]
struct ThumbnailResponse {
    thumbnail_url: String,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    url: String,
}

/// JSON client for the content gateway.
pub struct HttpStudio {
    client: Client,
    config: HttpStudioConfig,
}

impl HttpStudio {
    pub fn new(config: HttpStudioConfig) -> WorkerResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| WorkerError::config_error(format!("Failed to build HTTP client: {}", e)))?;
        info!("Content gateway at {}", config.base_url);
        Ok(Self { client, config })
    }

    pub fn from_env() -> WorkerResult<Self> {
        Self::new(HttpStudioConfig::from_env())
    }

    async fn post<B, R>(&self, endpoint: &str, body: &B) -> WorkerResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            WorkerError::transient(format!("{} request failed: {}", endpoint, e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(endpoint, status, &body));
        }

        debug!(endpoint, "Gateway call succeeded");
        response.json().await.map_err(|e| {
            WorkerError::permanent(format!("Failed to parse {} response: {}", endpoint, e))
        })
    }
}

#[async_trait]
impl ContentStudio for HttpStudio {
    async fn generate_script(&self, inputs: &JobInputs) -> WorkerResult<String> {
        let response: ScriptResponse = self
            .post(
                "/v1/script",
                &json!({
                    "topic": inputs.topic,
                    "style": inputs.style,
                    "target_length_secs": inputs.target_length_secs,
                }),
            )
            .await?;
        Ok(response.script)
    }

    async fn generate_narration(&self, script: &str, voice: Option<&str>) -> WorkerResult<String> {
        let response: AudioResponse = self
            .post("/v1/narration", &json!({ "script": script, "voice": voice }))
            .await?;
        Ok(response.audio_url)
    }

    async fn generate_visuals(&self, script: &str, inputs: &JobInputs) -> WorkerResult<Vec<String>> {
        let response: VisualsResponse = self
            .post(
                "/v1/visuals",
                &json!({ "script": script, "style": inputs.style }),
            )
            .await?;
        if response.visual_urls.is_empty() {
            return Err(WorkerError::permanent("/v1/visuals returned no visuals"));
        }
        Ok(response.visual_urls)
    }

    async fn assemble_video(
        &self,
        audio: &str,
        visuals: &[String],
        inputs: &JobInputs,
    ) -> WorkerResult<String> {
        let response: VideoResponse = self
            .post(
                "/v1/assembly",
                &json!({
                    "audio_url": audio,
                    "visual_urls": visuals,
                    "target_length_secs": inputs.target_length_secs,
                }),
            )
            .await?;
        Ok(response.video_url)
    }

    async fn generate_thumbnail(&self, video: &str, inputs: &JobInputs) -> WorkerResult<String> {
        let response: ThumbnailResponse = self
            .post(
                "/v1/thumbnail",
                &json!({ "video_url": video, "title": inputs.topic }),
            )
            .await?;
        Ok(response.thumbnail_url)
    }
}

#[async_trait]
impl Publisher for HttpStudio {
    async fn publish(
        &self,
        video: &str,
        channel_id: &str,
        metadata: &PublishMetadata,
    ) -> WorkerResult<String> {
        let response: PublishResponse = self
            .post(
                "/v1/publish",
                &json!({
                    "video_url": video,
                    "channel_id": channel_id,
                    "metadata": metadata,
                }),
            )
            .await?;
        Ok(response.url)
    }
}

/// Posts notifications to a webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    /// Webhook notifier if `NOTIFY_WEBHOOK_URL` is set.
    pub fn from_env() -> Option<Self> {
        std::env::var("NOTIFY_WEBHOOK_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .map(Self::new)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        let body = json!({ "severity": severity, "message": message });
        match self.client.post(&self.url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(severity = %severity, "Notification delivered");
            }
            Ok(response) => {
                warn!(status = %response.status(), "Notification webhook rejected message");
            }
            Err(e) => {
                warn!(error = %e, "Notification webhook unreachable");
            }
        }
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(severity = %severity, "{}", message),
            Severity::Warning => warn!(severity = %severity, "{}", message),
            Severity::Error | Severity::Critical => error!(severity = %severity, "{}", message),
        }
    }
}
