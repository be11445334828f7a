use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use cascade::planner::PlanError;
use cascade::{CascadeError, JobError};

/// Errors of the administrative routes. `/orchestrate` never uses this:
/// it reports every outcome in a 200 body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(_) => ApiError::NotFound(err.to_string()),
            JobError::InvalidRequest(_) | JobError::InvalidResumePointer(_) => {
                ApiError::BadRequest(err.to_string())
            }
            JobError::InvalidTransition { .. } | JobError::LeaseLost { .. } => {
                ApiError::Conflict(err.to_string())
            }
            JobError::Corrupt { .. } | JobError::Database(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<CascadeError> for ApiError {
    fn from(err: CascadeError) -> Self {
        match err {
            CascadeError::Job(e) => e.into(),
            CascadeError::Plan(e @ PlanError::NoSourceContent { .. }) => {
                ApiError::Unprocessable(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Unprocessable(_) => (StatusCode::UNPROCESSABLE_ENTITY, "UNPROCESSABLE"),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        let body = json!({
            "error": self.to_string(),
            "code": code,
        });
        (status, axum::Json(body)).into_response()
    }
}
