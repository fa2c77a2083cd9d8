//! # Core Traits (Ports)
//!
//! The cache talks to the outside world only through these traits. Adapters
//! in `api-adapters` and `storage-adapters` implement them; tests use the
//! mockall mocks exposed by the `testing` feature.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::Identity;

/// HTTP verbs the backend routes use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        f.write_str(verb)
    }
}

/// One concrete request shape: method, path relative to the API base, body.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Attach the session token header.
    pub authenticated: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), body: None, authenticated: true }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.authenticated = false;
        self
    }
}

impl fmt::Display for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// What came back. `body` is `None` when the response was empty or not JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl ApiResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self { status, body: Some(body) }
    }

    pub fn empty(status: u16) -> Self {
        Self { status, body: None }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// Server-provided `message`, if the body carries one.
    pub fn message(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|b| b.get("message").or_else(|| b.get("error")))
            .and_then(Value::as_str)
    }
}

/// The remote collaborator. `Err` means the transport failed outright;
/// any HTTP status, including errors, comes back as `Ok`.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> anyhow::Result<ApiResponse>;
}

/// Opaque key-value blob store used for persisted store state.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns the blob saved under `key`, if any.
    async fn load(&self, key: &str) -> anyhow::Result<Option<String>>;
    /// Replaces the blob under `key`.
    async fn save(&self, key: &str, blob: String) -> anyhow::Result<()>;
    /// Removes `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// Session credentials: the opaque auth token and who it belongs to.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait Credentials: Send + Sync {
    /// The raw token sent in the auth header.
    fn token(&self) -> Option<String>;
    fn identity(&self) -> Option<Identity>;
}
