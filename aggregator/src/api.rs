use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::QueueError;
use crate::store::StoreError;

/// The JSON body attached to every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub detail: String,
}

/// Errors surfaced by the HTTP layer.
///
/// Validation failures never mutate state; a duplicate event is not an error
/// anywhere in the pipeline (see [`crate::store::InsertOutcome`]).
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to decode request: {0}")]
    RequestDecodingError(String),

    #[error("request holds no event")]
    EmptyBatch,
    #[error("{0}")]
    InvalidEvent(String),

    #[error("event queue is unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),
    #[error("event store failed: {0}")]
    StoreFailed(#[from] StoreError),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::RequestDecodingError(_)
            | ApiError::EmptyBatch
            | ApiError::InvalidEvent(_) => "validation_error",
            ApiError::QueueUnavailable(_) => "queue_unavailable",
            ApiError::StoreFailed(error) if error.is_transient() => "store_unavailable",
            ApiError::StoreFailed(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::RequestDecodingError(_)
            | ApiError::EmptyBatch
            | ApiError::InvalidEvent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::StoreFailed(error) if error.is_transient() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::StoreFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind().to_owned(),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
