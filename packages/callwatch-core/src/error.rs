//! Centralized error types for the Callwatch core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the Callwatch realtime plane.
#[derive(Debug, Error)]
pub enum CallwatchError {
    /// Missing or invalid configuration at startup. Fatal for workers.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Rejected bearer token or failed OAuth exchange.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Malformed WebSocket or HTTP payload. Logged and dropped for streams.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Upstream returned 5xx or was unreachable; retried with backoff.
    #[error("Upstream unavailable: {0}")]
    Upstream(String),

    /// Base64, codec, or WAV parse failure.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Buffer overflow or subscriber saturation.
    #[error("Overloaded: {0}")]
    Overload(String),

    /// Alert, call, or recording not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallwatchError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Auth(_) => "auth_failed",
            Self::Protocol(_) => "protocol_error",
            Self::Upstream(_) => "upstream_unavailable",
            Self::Decode(_) => "decode_error",
            Self::Overload(_) => "overloaded",
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) | Self::Decode(_) | Self::Protocol(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Overload(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type CallwatchResult<T> = Result<T, CallwatchError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    /// Human-readable duplicate of `message` consumed by the dashboards.
    detail: String,
    status: u16,
}

impl IntoResponse for CallwatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        let body = ErrorResponse {
            error: self.code(),
            detail: message.clone(),
            message,
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for CallwatchError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for CallwatchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}
