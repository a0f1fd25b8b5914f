//! Error types for wirekit
//!
//! This module provides the error taxonomy for the request pipeline, including:
//! - Request construction failures (invalid URL components, body encoding)
//! - Response validation failures (missing or unacceptable status codes)
//! - Authorization failures (missing data, expired access or refresh token)
//! - Transport, decode, storage and transfer-task errors
//!
//! Whether an error is worth another attempt is decided by
//! [`IsRetryable`](crate::retry::IsRetryable), implemented in the retry module.

use crate::http::HttpResponse;
use crate::types::TaskId;
use std::ops::Range;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for wirekit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for wirekit
///
/// Every pipeline stage returns this type. Application code that needs its own
/// error vocabulary registers an [`ErrorMapper`](crate::pipeline::ErrorMapper)
/// and wraps its errors in [`Error::Custom`].
#[derive(Debug, Error)]
pub enum Error {
    /// Base URL, path and encoded query could not form a valid absolute URL
    #[error("invalid URL components: {0}")]
    InvalidUrlComponents(String),

    /// The transport produced something that is not an HTTP response
    #[error("response carried no HTTP status code")]
    NoStatusCode,

    /// The HTTP status is outside the endpoint's acceptable range
    #[error("unacceptable status code {code}, expected {}..{}", acceptable.start, acceptable.end)]
    UnacceptableStatusCode {
        /// Actual status code
        code: u16,
        /// Half-open range of accepted codes
        acceptable: Range<u16>,
        /// The full response, for callers that want to inspect the body
        response: Box<HttpResponse>,
    },

    /// The endpoint requires authorization but no data is stored
    #[error("missing authorization data")]
    MissingAuthorizationData,

    /// The access token expired and must be refreshed
    #[error("access token expired")]
    ExpiredAccessToken,

    /// The refresh token was rejected; the user has to authenticate again
    #[error("refresh token expired")]
    ExpiredRefreshToken,

    /// Token refresh failed for a reason other than an expired refresh token
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Network error reported by reqwest
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Transport-level failure reported by a non-reqwest transport
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport gave up waiting
    #[error("request timed out")]
    Timeout,

    /// The response body could not be decoded into the target type
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// The request body could not be encoded
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request or transfer was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Authorization storage collaborator failed
    #[error("authorization storage error: {0}")]
    Storage(String),

    /// No upload or download task is registered under this id
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Cannot perform operation in the task's current state
    #[error("cannot {operation} task {id} in state {current_state}")]
    InvalidState {
        /// The task the operation was attempted on
        id: TaskId,
        /// The operation that was attempted (e.g., "pause", "retry")
        operation: String,
        /// The state that prevents the operation
        current_state: String,
    },

    /// A recorded capture could not be replayed
    #[error("replay error: {0}")]
    Replay(String),

    /// File not found at the expected location
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "retry.retries")
        key: Option<String>,
    },

    /// Application-specific error produced by an error-mapping stage
    #[error(transparent)]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// HTTP status code carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::UnacceptableStatusCode { code, .. } => Some(*code),
            Error::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Wrap an application error
    pub fn custom<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Custom(Box::new(error))
    }
}

/// Authorization failure shared by every waiter of a single refresh
///
/// Unlike [`Error`] this type is `Clone`, so one refresh outcome can be handed
/// to all requests that were waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    /// Nothing stored
    #[error("missing authorization data")]
    Missing,

    /// Access token expired
    #[error("access token expired")]
    ExpiredAccessToken,

    /// Refresh token rejected
    #[error("refresh token expired")]
    ExpiredRefreshToken,

    /// Refresh failed (network, storage, malformed response)
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

impl From<AuthorizationError> for Error {
    fn from(error: AuthorizationError) -> Self {
        match error {
            AuthorizationError::Missing => Error::MissingAuthorizationData,
            AuthorizationError::ExpiredAccessToken => Error::ExpiredAccessToken,
            AuthorizationError::ExpiredRefreshToken => Error::ExpiredRefreshToken,
            AuthorizationError::RefreshFailed(reason) => Error::RefreshFailed(reason),
        }
    }
}

impl From<&Error> for AuthorizationError {
    fn from(error: &Error) -> Self {
        match error {
            Error::MissingAuthorizationData => AuthorizationError::Missing,
            Error::ExpiredAccessToken => AuthorizationError::ExpiredAccessToken,
            Error::ExpiredRefreshToken => AuthorizationError::ExpiredRefreshToken,
            other => AuthorizationError::RefreshFailed(other.to_string()),
        }
    }
}
