//! API routes.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::handlers::{
    cancel_schedule, get_job, get_queue_status, get_schedule, health, ready, reopen_job,
    run_publishing, run_recovery, schedule_job, submit_job,
};
use crate::metrics::metrics_middleware;
use crate::middleware::{
    cors_layer, cron_auth, rate_limit_middleware, request_id, request_logging, RateLimiterCache,
};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let job_routes = Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/reopen", post(reopen_job))
        .route("/jobs/:job_id/schedule", post(schedule_job));

    let schedule_routes = Router::new().route(
        "/schedules/:schedule_id",
        get(get_schedule).delete(cancel_schedule),
    );

    let rate_limiter = Arc::new(RateLimiterCache::new(state.config.rate_limit_rps));

    let api_routes = Router::new()
        .merge(job_routes)
        .merge(schedule_routes)
        .route("/queues", get(get_queue_status))
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ));

    // Called by the external scheduler; guarded by CRON_SECRET
    let cron_routes = Router::new()
        .route("/cron/publish", post(run_publishing))
        .route("/cron/recovery", post(run_recovery))
        .layer(middleware::from_fn_with_state(state.clone(), cron_auth));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(ready));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api", api_routes)
        .merge(cron_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}
