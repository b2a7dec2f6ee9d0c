//! Wire error shape and HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::runs::TrackerError;

/// Fixed set of wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed request (missing fields, illegal state transition).
    InvalidInput,
    /// Unknown run, session, or agent name.
    NotFound,
    /// Backend call failed or an internal error occurred.
    ServerError,
}

impl ErrorCode {
    fn status(self) -> StatusCode {
        match self {
            Self::InvalidInput => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Structured failure attached to a failed run.
///
/// Same shape as the HTTP error body so a run's error is directly
/// serializable into responses and events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RunError {
    /// Failure caused by the completion backend.
    #[must_use]
    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ServerError,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }
}

/// Error response body: `{code, message, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ApiError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    #[must_use]
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.code.status(), Json(self)).into_response()
    }
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        match &err {
            TrackerError::NotFound { .. } => Self::not_found(err.to_string()),
            // Illegal transitions are the caller's fault, not the server's.
            TrackerError::Conflict { .. } => Self::invalid_input(err.to_string()),
        }
    }
}
