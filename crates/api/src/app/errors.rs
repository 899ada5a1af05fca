use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use jobforge_core::QueueError;

/// Error returned by route handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("invalid request body: {0}")]
    Body(#[from] JsonRejection),

    #[error("invalid query string: {0}")]
    Query(#[from] QueryRejection),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Queue(err) => queue_error_to_response(err),
            other => json_error(StatusCode::BAD_REQUEST, "validation_error", other.to_string()),
        }
    }
}

pub fn queue_error_to_response(err: QueueError) -> Response {
    let message = err.to_string();
    match err {
        QueueError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        QueueError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        QueueError::InvalidState { .. } => json_error(StatusCode::CONFLICT, "invalid_state", message),
        QueueError::UnknownType(_) => json_error(StatusCode::BAD_REQUEST, "unknown_type", message),
        QueueError::StoreUnavailable(_) => {
            tracing::error!(error = %message, "job store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", message)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
