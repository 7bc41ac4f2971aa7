//! Mapping of engine errors onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use waypoint::TaskError;

/// Errors returned by the API handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Task(TaskError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Task(TaskError::ValidationError(_)) => {
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            ApiError::Task(TaskError::UnknownTaskType(_)) => {
                (StatusCode::BAD_REQUEST, "unknown_task_type")
            }
            ApiError::Task(TaskError::Conflict { .. }) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Task(TaskError::StorageError(_))
            | ApiError::Task(TaskError::SerializationError(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_error")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": code,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
