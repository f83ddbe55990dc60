//! Publish schedule lookup and cancellation.

use axum::extract::{Path, State};
use axum::Json;
use reelsmith_models::{PublishSchedule, ScheduleId};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn get_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> ApiResult<Json<PublishSchedule>> {
    let schedule = state
        .service
        .get_schedule(&ScheduleId::from_string(schedule_id))
        .await?;
    Ok(Json(schedule))
}

/// Cancel a pending schedule. Cancelling twice returns the cancelled schedule.
pub async fn cancel_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> ApiResult<Json<PublishSchedule>> {
    let schedule = state
        .service
        .cancel_schedule(&ScheduleId::from_string(schedule_id))
        .await?;
    Ok(Json(schedule))
}
