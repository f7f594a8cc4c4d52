//! HTTP error responses.
//!
//! Every handler error becomes an [`ApiError`], rendered as the XRPC error
//! body `{"error": "<Code>", "message": "..."}`.

use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use peruse_events::FeedError;
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;

// ============================================================================
// ERROR CODES
// ============================================================================

/// Error codes surfaced to feed clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Missing or invalid request credentials.
    AuthRequired,
    /// The `feed` parameter is not a valid AT-URI.
    InvalidFeed,
    /// No feed is registered under the requested record key.
    FeedNotFound,
    InvalidCursor,
    InvalidInput,

    /// A feed could not produce a page.
    FeedError,
    #[serde(rename = "InternalServerError")]
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::AuthRequired
            | ErrorCode::InvalidFeed
            | ErrorCode::FeedNotFound
            | ErrorCode::InvalidCursor
            | ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,

            ErrorCode::FeedError | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "Authentication required",
            ErrorCode::InvalidFeed => "Invalid feed URI",
            ErrorCode::FeedNotFound => "Feed not found",
            ErrorCode::InvalidCursor => "Invalid cursor",
            ErrorCode::InvalidInput => "Invalid input",
            ErrorCode::FeedError => "Unable to get posts for feed",
            ErrorCode::InternalError => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR
// ============================================================================

/// Error body returned by every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "error")]
    pub code: ErrorCode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// An error carrying only its code.
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    pub fn auth_required() -> Self {
        Self::from_code(ErrorCode::AuthRequired)
    }

    pub fn invalid_feed() -> Self {
        Self::from_code(ErrorCode::InvalidFeed)
    }

    pub fn feed_not_found() -> Self {
        Self::from_code(ErrorCode::FeedNotFound)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn feed_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FeedError, message)
    }

    pub fn internal_error() -> Self {
        Self::from_code(ErrorCode::InternalError)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => write!(f, "{}: {}", self.code, self.code.default_message()),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

/// Result type for handlers.
pub type ApiResult<T> = Result<T, ApiError>;

impl From<FeedError> for ApiError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::InvalidCursor { value } => {
                ApiError::new(ErrorCode::InvalidCursor, format!("Invalid cursor {value:?}"))
            }
            FeedError::AuthRequired => ApiError::auth_required(),
            FeedError::Unavailable { message } => ApiError::feed_error(message),
            // Backend detail stays in the logs.
            FeedError::Backend(_) => ApiError::from_code(ErrorCode::FeedError),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(_: AuthError) -> Self {
        ApiError::auth_required()
    }
}

// ============================================================================
// TESTS
// ============================================================================
