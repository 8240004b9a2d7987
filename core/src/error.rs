//! Error types for the admin API client.
//!
//! # Design
//! Every failure a caller can observe is a distinct variant so the caller can
//! act on it: re-authenticate on `Auth`, fix input on `InvalidRequest`, retry
//! later on `Network`/`Timeout`. Local failures (encoding, validation,
//! completeness) never reach the network. Payloads are plain strings and
//! integers so the error is `Clone` and one batch failure can be reported in
//! every bulk slot it covers.

use std::time::Duration;

use thiserror::Error;

/// Result type for admin API operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors returned by the admin API client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// No environment with this name is registered.
    #[error("unknown environment: {name}")]
    UnknownEnvironment { name: String },

    /// An environment's headers do not belong to its own base address.
    #[error("environment {name} is inconsistent: {reason}")]
    InvalidEnvironment { name: String, reason: String },

    /// The operation kind is not in the request registry.
    #[error("unsupported request kind: {kind}")]
    UnsupportedRequestKind { kind: String },

    /// The parameters do not fit the operation kind.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request never produced an HTTP response.
    #[error("network error: {0}")]
    Network(String),

    /// A single network call exceeded the configured timeout.
    #[error("request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The session was rejected (401/403). The session manager must
    /// re-authenticate before the call can succeed.
    #[error("authentication rejected with HTTP {status}")]
    Auth { status: u16 },

    /// The server returned a non-2xx status other than 401/403.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The response body is not a well-formed envelope for the request.
    #[error("invalid response shape: {0}")]
    InvalidResponseShape(String),

    /// The requested item does not exist in this environment.
    #[error("item not found: {disp_id}")]
    NotFound { disp_id: String },

    /// A full-object write would silently drop fields of the original.
    #[error("candidate object is missing fields: {}", missing.join(", "))]
    IncompleteObject { missing: Vec<String> },

    /// Some, but not all, items of a bulk read failed.
    #[error("{failed} of {total} bulk items failed")]
    PartialBulkFailure { failed: usize, total: usize },

    /// The operation was cancelled before this part was dispatched.
    #[error("operation cancelled")]
    Cancelled,

    /// A request payload could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Client configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ApiError {
    /// Whether a read-class request may be re-sent after this error.
    ///
    /// Write-class requests are never retried regardless of this value.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Timeout { .. } => true,
            ApiError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// True for the per-item "does not exist" answer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Serialization(e.to_string())
    }
}
