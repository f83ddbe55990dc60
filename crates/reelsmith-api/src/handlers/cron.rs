//! Trigger endpoints for the external scheduler.
//!
//! Each call runs one budget-bounded batch and returns its summary. A call
//! that overlaps a running batch for the same queue gets `409`.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use reelsmith_models::TriggerSummary;
use tracing::info;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn run_publishing(State(state): State<AppState>) -> ApiResult<Json<TriggerSummary>> {
    info!("Publishing trigger invoked");
    Ok(Json(state.service.run_due_publishing(Utc::now()).await?))
}

pub async fn run_recovery(State(state): State<AppState>) -> ApiResult<Json<TriggerSummary>> {
    info!("Recovery trigger invoked");
    Ok(Json(state.service.run_due_recovery(Utc::now()).await?))
}
