//! # HTTP transport
//!
//! `RemoteTransport` over reqwest. Every HTTP status comes back as an
//! `ApiResponse`; only connection-level failures are errors. Bodies that are
//! empty or not JSON are reported as `body: None`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domains::{ApiRequest, ApiResponse, Credentials, Method, RemoteTransport};
use reqwest::header::HeaderName;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_AUTH_HEADER: &str = "x-auth-token";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid auth header name {0:?}")]
    InvalidHeader(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// API root, e.g. `https://api.example.com/api`.
    pub base_url: String,
    /// Header carrying the raw session token.
    pub auth_header: String,
    /// `None` means requests never time out.
    pub timeout: Option<Duration>,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), auth_header: DEFAULT_AUTH_HEADER.into(), timeout: None }
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth_header: HeaderName,
    credentials: Arc<dyn Credentials>,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig, credentials: Arc<dyn Credentials>) -> Result<Self, TransportError> {
        let auth_header = HeaderName::from_bytes(config.auth_header.as_bytes())
            .map_err(|_| TransportError::InvalidHeader(config.auth_header.clone()))?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header,
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> anyhow::Result<ApiResponse> {
        let mut builder = self
            .client
            .request(to_reqwest(request.method), self.url(&request.path));

        if request.authenticated {
            if let Some(token) = self.credentials.token() {
                builder = builder.header(self.auth_header.clone(), token);
            }
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice(&bytes).ok()
        };

        debug!(%request, status, has_body = body.is_some(), "response received");
        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticCredentials;

    #[test]
    fn test_rejects_bad_header_name() {
        let mut config = HttpTransportConfig::new("http://localhost");
        config.auth_header = "bad header".into();
        let result = HttpTransport::new(config, Arc::new(StaticCredentials::anonymous()));
        assert!(matches!(result, Err(TransportError::InvalidHeader(_))));
    }

    #[test]
    fn test_url_joining() {
        let transport = HttpTransport::new(
            HttpTransportConfig::new("http://localhost/api/"),
            Arc::new(StaticCredentials::anonymous()),
        )
        .unwrap();
        assert_eq!(transport.url("/posts"), "http://localhost/api/posts");
        assert_eq!(transport.url("posts"), "http://localhost/api/posts");
    }
}
