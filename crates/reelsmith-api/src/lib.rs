//! Axum HTTP API server.
//!
//! This crate provides:
//! - Job submission, status and reopen endpoints
//! - Publish schedule management
//! - Cron trigger endpoints for the publishing and recovery queues
//! - Per-IP rate limiting, request ids and Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
