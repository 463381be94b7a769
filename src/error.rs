//! Error types for cache handling and API responses

use crate::models::validator::InvalidReason;
use crate::readiness::ReadinessFailure;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Classified cache and acquisition errors
///
/// Raw I/O errors never cross the validator boundary; they arrive here already
/// reduced to a kind so waiters can be handed the same cloned value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("no cached copy of {0} was found")]
    NotFound(String),

    #[error("required file '{file}' is missing")]
    Incomplete { file: String },

    #[error("required file '{file}' is corrupted: {reason}")]
    Corrupted { file: String, reason: InvalidReason },

    #[error("permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("not enough disk space")]
    StorageFull,

    #[error("timed out waiting for external download to finish")]
    ExternalActivityTimeout,

    #[error("giving up after {attempts} attempts: {last}")]
    RetryBudgetExhausted { attempts: u32, last: Box<CacheError> },

    #[error("download failed: {message}")]
    Download { message: String },

    #[error("acquisition was cancelled")]
    Cancelled,

    #[error("unknown model id '{0}'")]
    UnknownModel(String),
}

/// Convenience type alias for cache results
pub type CacheResult<T> = Result<T, CacheError>;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    /// Model could not be made ready; carries only the user-facing category
    Unavailable(ReadinessFailure),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, category) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::Unavailable(failure) => {
                tracing::warn!(
                    class = ?failure.class,
                    error = %failure.error,
                    attempts = failure.attempts,
                    "Model not ready"
                );
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    failure.class.user_message().to_string(),
                    Some(failure.class.category()),
                )
            }
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                )
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            category,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::UnknownModel(_) => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(anyhow::Error::new(other)),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<&'static str>,
    timestamp: chrono::DateTime<chrono::Utc>,
}
