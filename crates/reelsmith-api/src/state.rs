//! Application state.

use std::sync::Arc;

use reelsmith_store::{KvStore, RedisStore};
use reelsmith_worker::{
    Collaborators, HttpStudio, LogNotifier, Notifier, PipelineService, WebhookNotifier,
    WorkerConfig,
};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub service: Arc<PipelineService>,
}

impl AppState {
    /// Wire the pipeline service from the environment.
    pub fn from_env(config: ApiConfig) -> anyhow::Result<Self> {
        let kv: Arc<dyn KvStore> = Arc::new(RedisStore::from_env()?);
        let studio = Arc::new(HttpStudio::from_env()?);
        let notifier: Arc<dyn Notifier> = match WebhookNotifier::from_env() {
            Some(webhook) => Arc::new(webhook),
            None => Arc::new(LogNotifier),
        };

        let service = PipelineService::new(
            kv,
            Collaborators {
                studio: studio.clone(),
                publisher: studio,
                notifier,
            },
            WorkerConfig::from_env(),
        );
        Ok(Self::new(config, service))
    }

    pub fn new(config: ApiConfig, service: PipelineService) -> Self {
        Self {
            config,
            service: Arc::new(service),
        }
    }
}
