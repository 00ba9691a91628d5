//! Error types for callsync-engine
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use callsync_common::CallStatus;
use serde_json::json;
use thiserror::Error;

use crate::provider::ProviderError;

/// Main error type for callsync-engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Shared-library errors (config resolution, db init)
    #[error(transparent)]
    Common(#[from] callsync_common::Error),

    /// Payload could not be mapped to a canonical call event
    #[error("Normalize error: {0}")]
    Normalize(String),

    /// State machine rejected a transition in strict mode
    #[error("Invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: CallStatus,
        to: CallStatus,
        reason: String,
    },

    /// Inbox row carries a source this build does not understand
    #[error("Unknown event source: {0}")]
    UnknownSource(String),

    /// Satellite event refers to a call that has not been stored yet
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Optimistic write lost too many races
    #[error("Write conflict on call {0}")]
    WriteConflict(String),

    /// Provider REST API errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the inbox worker should pick the event up again automatically
    ///
    /// Classification and validation failures repeat deterministically, so they
    /// wait for an operator instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Database(_)
            | Error::Common(_)
            | Error::CallNotFound(_)
            | Error::WriteConflict(_)
            | Error::Internal(_) => true,
            Error::Provider(e) => e.is_retryable(),
            Error::Config(_)
            | Error::Normalize(_)
            | Error::InvalidTransition { .. }
            | Error::UnknownSource(_)
            | Error::Http(_)
            | Error::Serialization(_) => false,
        }
    }
}

/// Convenience Result type using callsync-engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Missing or wrong signature / bearer token (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Engine error
    #[error(transparent)]
    Engine(#[from] Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Engine(Error::Normalize(msg)) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Engine(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ENGINE_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::CallNotFound("CA1".into()).is_retryable());
        assert!(Error::WriteConflict("CA1".into()).is_retryable());
        assert!(!Error::UnknownSource("sms".into()).is_retryable());
        assert!(!Error::InvalidTransition {
            from: CallStatus::Completed,
            to: CallStatus::Ringing,
            reason: "cannot leave a final state".into(),
        }
        .is_retryable());
        assert!(Error::Provider(ProviderError::Timeout).is_retryable());
        assert!(!Error::Provider(ProviderError::NotFound("CA1".into())).is_retryable());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = Error::InvalidTransition {
            from: CallStatus::Completed,
            to: CallStatus::Ringing,
            reason: "cannot leave a final state".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition completed -> ringing: cannot leave a final state"
        );
    }
}
