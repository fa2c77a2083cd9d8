//! # SyncError
//!
//! Centralized error type for the client cache. Every store operation that
//! fails records the message in its store-local `error` field and returns one
//! of these to the caller.

use thiserror::Error;

/// The primary error type for all store and probing operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// An authenticated operation was invoked without a session token.
    #[error("not authenticated: no session token available")]
    NotAuthenticated,

    /// Entity is not present in the local store
    #[error("{kind} not found with ID {id}")]
    NotFound { kind: String, id: String },

    /// The transport itself failed (DNS, connection reset, ...)
    #[error("network error: {0}")]
    Transport(String),

    /// Server answered with a non-2xx, non-404 status
    #[error("server returned {status}: {message}")]
    Http { status: u16, message: String },

    /// Every known endpoint variant answered 404
    #[error("no endpoint found for {operation}")]
    EndpointNotFound { operation: String },

    /// 2xx response whose envelope carried `success: false`
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Expected JSON was missing or unreadable
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The operation has no candidate requests configured
    #[error("no candidates configured for {0}")]
    NoCandidates(String),

    /// Input rejected before any mutation (e.g. empty comment)
    #[error("validation error: {0}")]
    Validation(String),

    /// Blob store read/write failure
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl SyncError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        SyncError::NotFound { kind: kind.into(), id: id.into() }
    }

    /// True for failures that mean "the address was wrong", not "the call failed".
    pub fn is_endpoint_not_found(&self) -> bool {
        matches!(self, SyncError::EndpointNotFound { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedResponse(err.to_string())
    }
}

/// A specialized Result type for cache operations.
pub type Result<T> = std::result::Result<T, SyncError>;
