//! Job submission, status and reopen.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use reelsmith_models::{JobId, JobInputs, JobRecord, PublishMetadata, PublishSchedule, Visibility};
use serde::Deserialize;
use tracing::info;
use validator::Validate;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Submit a job. Production starts on the next recovery trigger.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(inputs): Json<JobInputs>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    let record = state.service.submit(inputs).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    let record = state.service.get_job(&JobId::from_string(job_id)).await?;
    Ok(Json(record))
}

/// Reopen a failed job and queue a fresh run.
pub async fn reopen_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    let record = state.service.reopen(&JobId::from_string(job_id)).await?;
    info!(job_id = %record.id, stage = %record.stage, "Job reopened via API");
    Ok(Json(record))
}

/// Publish request. Omitted metadata fields default from the job inputs.
#[derive(Debug, Deserialize, Validate)]
pub struct ScheduleRequest {
    pub publish_at: DateTime<Utc>,
    #[validate(length(min = 1, max = 100))]
    pub title: Option<String>,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    #[validate(length(max = 30))]
    pub tags: Option<Vec<String>>,
    pub visibility: Option<Visibility>,
}

impl ScheduleRequest {
    fn metadata(self, defaults: PublishMetadata) -> PublishMetadata {
        PublishMetadata {
            title: self.title.unwrap_or(defaults.title),
            description: self.description.unwrap_or(defaults.description),
            tags: self.tags.unwrap_or(defaults.tags),
            visibility: self.visibility.unwrap_or(defaults.visibility),
        }
    }
}

/// Schedule (or move) publication of a job.
pub async fn schedule_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<ScheduleRequest>,
) -> ApiResult<Json<PublishSchedule>> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let job_id = JobId::from_string(job_id);
    let record = state.service.get_job(&job_id).await?;
    let publish_at = request.publish_at;
    let metadata = request.metadata(PublishMetadata::from_inputs(&record.inputs));

    let schedule = state
        .service
        .schedule_publish(&job_id, publish_at, Some(metadata))
        .await?;
    Ok(Json(schedule))
}
