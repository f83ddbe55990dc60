//! Reelsmith pipeline worker.
//!
//! This crate provides:
//! - Collaborator interfaces for the content studio, publisher and notifier
//!   plus their HTTP implementations
//! - A retry executor with exponential backoff
//! - The pipeline orchestrator that runs and checkpoints the stages
//! - The pipeline service: job submission, publish schedules and the
//!   recovery and publishing triggers
//! - Structured job logging and metrics

pub mod config;
pub mod error;
pub mod http_client;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod service;
pub mod studio;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{Provider, ProviderLimits, WorkerConfig};
pub use error::{ErrorKind, WorkerError, WorkerResult};
pub use http_client::{HttpStudio, HttpStudioConfig, LogNotifier, WebhookNotifier};
pub use logging::JobLogger;
pub use orchestrator::PipelineOrchestrator;
pub use retry::{with_retry, FailureTracker, RetryConfig};
pub use service::{Collaborators, PipelineService, QueueStatus};
pub use studio::{ContentStudio, Notifier, Publisher};
