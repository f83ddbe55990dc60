//! Queue status.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use reelsmith_worker::QueueStatus;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn get_queue_status(State(state): State<AppState>) -> ApiResult<Json<QueueStatus>> {
    Ok(Json(state.service.queue_status(Utc::now()).await?))
}
