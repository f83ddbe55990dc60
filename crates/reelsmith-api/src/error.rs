//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use reelsmith_models::ModelError;
use reelsmith_worker::{ErrorKind, WorkerError};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<WorkerError> for ApiError {
    fn from(err: WorkerError) -> Self {
        if err.is_already_processing() {
            return ApiError::Conflict("a trigger for this queue is already running".to_string());
        }
        match &err {
            WorkerError::JobNotFound(_) | WorkerError::ScheduleNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            WorkerError::Conflict(msg) => ApiError::Conflict(msg.clone()),
            WorkerError::Model(ModelError::InvalidInputs(msg)) => ApiError::Validation(msg.clone()),
            WorkerError::Model(_) => ApiError::Conflict(err.to_string()),
            _ if err.kind() == ErrorKind::Transient => ApiError::Unavailable(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal details stay in the logs in production
        let detail = match &self {
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                if std::env::var("ENVIRONMENT").unwrap_or_default() == "production" {
                    "An internal error occurred".to_string()
                } else {
                    self.to_string()
                }
            }
            _ => self.to_string(),
        };

        (status, Json(ErrorResponse { detail })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelsmith_queue::QueueError;

    #[test]
    fn test_worker_error_mapping() {
        let status = |e: WorkerError| ApiError::from(e).status_code();

        assert_eq!(status(WorkerError::JobNotFound("j".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(WorkerError::conflict("failed")), StatusCode::CONFLICT);
        assert_eq!(
            status(WorkerError::Queue(QueueError::AlreadyProcessing)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(WorkerError::Model(ModelError::invalid_inputs("topic"))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(WorkerError::transient("store down")),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(WorkerError::permanent("bad")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
