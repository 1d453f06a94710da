//! Unified API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::engine::EngineError;
use crate::queue::QueueError;
use crate::runs::RunError;
use crate::store::StoreError;

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        details: Option<String>,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            details: None,
        }
    }

    pub fn validation_with(msg: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            details: Some(details.into()),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            _ => {
                debug!(error_code = code, message = %message, "Client error");
            }
        }

        let details = match self {
            ApiError::Validation { details, .. } => details,
            _ => None,
        };
        let body = ErrorResponse {
            error: message,
            code,
            details,
        };

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ThreadNotFound(_)
            | StoreError::RunNotFound(_)
            | StoreError::MissingGraph(_) => ApiError::NotFound(err.to_string()),
            StoreError::AlreadyExists(_) | StoreError::Busy(_) => ApiError::Conflict(err.to_string()),
            StoreError::InvalidArgument(msg) => ApiError::validation(msg),
            StoreError::Engine(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::GraphNotFound(_) => ApiError::NotFound(err.to_string()),
            EngineError::InvalidInput(msg) => ApiError::validation(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(_) => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Store(e) => e.into(),
            RunError::Queue(e) => e.into(),
            RunError::Engine(e) => e.into(),
            not_found @ RunError::NotInThread { .. } => ApiError::NotFound(not_found.to_string()),
        }
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_status() {
        let cases = [
            (StoreError::ThreadNotFound("t".into()), StatusCode::NOT_FOUND),
            (StoreError::MissingGraph("t".into()), StatusCode::NOT_FOUND),
            (StoreError::Busy("t".into()), StatusCode::CONFLICT),
            (StoreError::AlreadyExists("t".into()), StatusCode::CONFLICT),
            (
                StoreError::InvalidArgument("limit".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                StoreError::Corrupt("bad row".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_run_errors_map_to_status() {
        let err = RunError::Engine(EngineError::GraphNotFound("g".into()));
        assert_eq!(ApiError::from(err).status_code(), StatusCode::NOT_FOUND);

        let err = RunError::NotInThread {
            run_id: "r".into(),
            thread_id: "t".into(),
        };
        assert_eq!(ApiError::from(err).status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ApiError::validation("x").error_code(), "VALIDATION_ERROR");
        assert_eq!(ApiError::not_found("x").error_code(), "NOT_FOUND");
        assert_eq!(ApiError::conflict("x").error_code(), "CONFLICT");
        assert_eq!(ApiError::internal("x").error_code(), "INTERNAL_ERROR");
    }
}
