//! Error types for Quarry services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - HTTP status code mapping
//! - Structured error responses
//! - Turn-level severity (abort vs. contain)

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    InvalidFormat,

    // Resource errors (4xxx)
    SessionNotFound,

    // Conflict errors (5xxx)
    SessionBusy,
    VersionConflict,

    // Rate limiting (6xxx)
    RateLimited,

    // External service errors (8xxx)
    UpstreamError,
    SchemaValidationError,
    StreamError,
    CacheError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::InvalidFormat => 1003,

            ErrorCode::SessionNotFound => 4005,

            ErrorCode::SessionBusy => 5004,
            ErrorCode::VersionConflict => 5005,

            ErrorCode::RateLimited => 6001,

            ErrorCode::UpstreamError => 8001,
            ErrorCode::SchemaValidationError => 8007,
            ErrorCode::StreamError => 8008,
            ErrorCode::CacheError => 8006,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>
    },

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    // Resource errors
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    // Conflict errors
    #[error("Session {id} is already processing a message")]
    SessionBusy { id: String },

    #[error("Session {id} changed concurrently: expected version {expected}, found {actual}")]
    VersionConflict { id: String, expected: u64, actual: u64 },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // External service errors
    #[error("{service} call failed: {message}")]
    Upstream { service: String, message: String },

    #[error("Structured output failed validation: {message}")]
    SchemaValidation { message: String },

    #[error("Stream failed: {message}")]
    Stream { message: String },

    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Shorthand for an upstream (transient) failure
    pub fn upstream(service: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Upstream {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            AppError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            AppError::SessionBusy { .. } => ErrorCode::SessionBusy,
            AppError::VersionConflict { .. } => ErrorCode::VersionConflict,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::Upstream { .. } => ErrorCode::UpstreamError,
            AppError::SchemaValidation { .. } => ErrorCode::SchemaValidationError,
            AppError::Stream { .. } => ErrorCode::StreamError,
            AppError::Cache { .. } => ErrorCode::CacheError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } |
            AppError::InvalidFormat { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            AppError::SessionNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::SessionBusy { .. } |
            AppError::VersionConflict { .. } => StatusCode::CONFLICT,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Internal { .. } |
            AppError::Configuration { .. } |
            AppError::Serialization(_) |
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::Upstream { .. } |
            AppError::SchemaValidation { .. } |
            AppError::Stream { .. } |
            AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::Cache { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whether this error aborts the current turn.
    ///
    /// Only configuration and schema failures end a turn; everything else
    /// raised inside the loop is contained and the loop carries on.
    pub fn is_fatal_for_turn(&self) -> bool {
        matches!(
            self,
            AppError::Configuration { .. } | AppError::SchemaValidation { .. }
        )
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                details: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Cache {
            message: err.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::SessionNotFound { id: "test".into() };
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_busy_session_is_conflict() {
        let err = AppError::SessionBusy { id: "s1".into() };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert!(err.is_client_error());
        assert!(!err.is_fatal_for_turn());
    }

    #[test]
    fn test_turn_fatality() {
        assert!(AppError::Configuration { message: "no collection".into() }.is_fatal_for_turn());
        assert!(AppError::SchemaValidation { message: "bad".into() }.is_fatal_for_turn());
        assert!(!AppError::upstream("search", "timeout").is_fatal_for_turn());
        assert!(!AppError::Stream { message: "reset".into() }.is_fatal_for_turn());
    }

    #[test]
    fn test_server_error() {
        let err = AppError::Internal {
            message: "Something went wrong".into()
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.is_server_error());
        assert_eq!(err.code().as_code(), 9001);
    }
}
