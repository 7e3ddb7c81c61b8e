//! Error types for the VoiceHub server.
//!
//! This module defines the top-level error used by every service and route
//! handler, and how it is rendered as an HTTP response.
//!
//! # Error Types
//!
//! - [`ServerError`] - Top-level server errors encompassing all failure modes
//! - [`ErrorResponse`] - JSON body returned to clients
//!
//! Module-specific errors (`ConfigError`, `SupabaseError`, `JwtError`,
//! `EncryptionError`) convert into [`ServerError`] with `?`.
//!
//! Client-facing messages are passed through [`crate::redact::redact`];
//! server-side failures are logged and replaced with a generic message.

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::ConfigError;
use crate::encryption::EncryptionError;
use crate::jwt::JwtError;
use crate::redact::redact;
use crate::supabase::SupabaseError;

/// Header name for rate limit retry delay.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Top-level error type for the VoiceHub server.
///
/// # Error Categories
///
/// - **Configuration errors**: Problems loading or validating server config
/// - **Authentication errors**: Invalid credentials, expired or revoked tokens
/// - **Authorization errors**: Missing scopes or access to another user's data
/// - **Validation errors**: Malformed or out-of-range request data
/// - **Rate limiting**: Client exceeded allowed request rate
/// - **Upstream errors**: Supabase failed or is unreachable
/// - **Internal errors**: Unexpected failures that don't fit other categories
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization or runtime.
    Config(ConfigError),

    /// Authentication failure (401).
    Auth(String),

    /// The caller is authenticated but not allowed to do this (403).
    Forbidden(String),

    /// Request validation failure (400).
    Validation(String),

    /// The requested resource does not exist or is not visible to the caller (404).
    NotFound(String),

    /// The request conflicts with existing state (409).
    Conflict(String),

    /// Rate limit exceeded (429).
    ///
    /// The `retry_after` field indicates how many seconds the client
    /// should wait before retrying.
    RateLimit {
        /// Limit category that was exceeded (e.g. `auth`, `api`).
        source: String,
        /// Number of seconds until the rate limit resets.
        retry_after: u64,
    },

    /// Supabase returned an error or an unexpected response (502).
    Upstream(String),

    /// A required upstream service is unreachable or not configured (503).
    Unavailable(String),

    /// Unexpected internal server error (500).
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth(msg) => write!(f, "authentication failed: {msg}"),
            Self::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::NotFound(what) => write!(f, "{what} not found"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::RateLimit {
                source,
                retry_after,
            } => {
                write!(
                    f,
                    "rate limit exceeded for {source}, retry after {retry_after} seconds"
                )
            }
            Self::Upstream(msg) => write!(f, "upstream error: {msg}"),
            Self::Unavailable(msg) => write!(f, "service unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<SupabaseError> for ServerError {
    fn from(err: SupabaseError) -> Self {
        match err {
            SupabaseError::Unauthorized => Self::Auth("invalid credentials".to_string()),
            SupabaseError::Rejected { status: 409, message } => Self::Conflict(message),
            SupabaseError::Rejected { status: 404, .. } => {
                Self::NotFound("requested resource".to_string())
            }
            SupabaseError::Timeout(_)
            | SupabaseError::Unavailable(_)
            | SupabaseError::RetriesExhausted { .. } => Self::Unavailable(err.to_string()),
            SupabaseError::Configuration(_) => Self::Internal(err.to_string()),
            SupabaseError::Rejected { .. } | SupabaseError::InvalidResponse(_) => {
                Self::Upstream(err.to_string())
            }
        }
    }
}

impl From<JwtError> for ServerError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::MissingScopes(_) => Self::Forbidden(err.to_string()),
            JwtError::Encoding(_) => Self::Internal(err.to_string()),
            _ => Self::Auth(err.to_string()),
        }
    }
}

impl From<EncryptionError> for ServerError {
    fn from(err: EncryptionError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl ServerError {
    /// Creates a new authentication error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use voicehub_server::error::ServerError;
    ///
    /// let err = ServerError::auth("invalid token");
    /// assert!(matches!(err, ServerError::Auth(_)));
    /// ```
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Creates a new authorization error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// Creates a new validation error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use voicehub_server::error::ServerError;
    ///
    /// let err = ServerError::validation("title is required");
    /// assert!(matches!(err, ServerError::Validation(_)));
    /// ```
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a new not-found error for the named resource.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates a new conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Creates a new rate limit error.
    ///
    /// # Arguments
    ///
    /// * `source` - Limit category that was exceeded
    /// * `retry_after` - Seconds until the client can retry
    ///
    /// # Example
    ///
    /// ```rust
    /// use voicehub_server::error::ServerError;
    ///
    /// let err = ServerError::rate_limit("auth", 60);
    /// assert!(matches!(err, ServerError::RateLimit { .. }));
    /// ```
    pub fn rate_limit(source: impl Into<String>, retry_after: u64) -> Self {
        Self::RateLimit {
            source: source.into(),
            retry_after,
        }
    }

    /// Creates a new service-unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Creates a new internal error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use voicehub_server::error::ServerError;
    ///
    /// let err = ServerError::internal("unexpected empty insert response");
    /// assert!(matches!(err, ServerError::Internal(_)));
    /// ```
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Auth(_)
                | Self::Forbidden(_)
                | Self::Validation(_)
                | Self::NotFound(_)
                | Self::Conflict(_)
                | Self::RateLimit { .. }
        )
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration_error",
            Self::Auth(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::RateLimit { .. } => "rate_limited",
            Self::Upstream(_) => "upstream_error",
            Self::Unavailable(_) => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message safe to return to the client.
    ///
    /// Client errors keep their (redacted) detail; server errors are replaced
    /// with a generic message.
    pub fn public_message(&self) -> String {
        match self {
            Self::Upstream(_) => "upstream service error".to_string(),
            Self::Unavailable(_) => "service temporarily unavailable".to_string(),
            Self::Config(_) | Self::Internal(_) => "internal server error".to_string(),
            _ => redact(&self.to_string()),
        }
    }
}

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if self.is_server_error() {
            error!(status = status.as_u16(), error = %redact(&self.to_string()), "Request failed");
        } else if matches!(self, Self::RateLimit { .. }) {
            warn!(error = %self, "Request rate limited");
        }

        let body = Json(ErrorResponse::new(self.public_message()).with_code(self.code()));

        match self {
            Self::RateLimit { retry_after, .. } => (
                status,
                [(HEADER_RETRY_AFTER, retry_after.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
