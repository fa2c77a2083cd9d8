//! Shared fixtures: a scripted backend that records every call, a logged-in
//! session and payload builders.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use api_adapters::StaticCredentials;
use async_trait::async_trait;
use domains::{ApiRequest, ApiResponse, BlobStore, Credentials, Identity, RemoteTransport};
use secrecy::SecretString;
use serde_json::{json, Value};
use services::{AppStores, StoreOptions};
use tokio::sync::Notify;

pub const USER_ID: &str = "user-1";

type Handler = Box<dyn Fn(&ApiRequest) -> anyhow::Result<ApiResponse> + Send + Sync>;

/// Holds one request until released, so tests can interleave responses.
pub struct Gate {
    pub call: String,
    pub arrived: Notify,
    pub release: Notify,
}

pub struct Backend {
    calls: Mutex<Vec<String>>,
    handler: Handler,
    gate: Option<Arc<Gate>>,
}

impl Backend {
    pub fn new(handler: impl Fn(&ApiRequest) -> anyhow::Result<ApiResponse> + Send + Sync + 'static) -> Self {
        Self { calls: Mutex::new(Vec::new()), handler: Box::new(handler), gate: None }
    }

    /// Every request answers `status` with no body.
    pub fn status(status: u16) -> Self {
        Self::new(move |_| Ok(ApiResponse::empty(status)))
    }

    pub fn offline() -> Self {
        Self::new(|_| Err(anyhow::anyhow!("connection refused")))
    }

    /// Holds requests rendering as `call` (e.g. `POST /posts/p1/like`).
    pub fn gated(mut self, call: &str) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate { call: call.into(), arrived: Notify::new(), release: Notify::new() });
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteTransport for Backend {
    async fn send(&self, request: &ApiRequest) -> anyhow::Result<ApiResponse> {
        let call = request.to_string();
        self.calls.lock().unwrap().push(call.clone());
        if let Some(gate) = &self.gate {
            if gate.call == call {
                gate.arrived.notify_one();
                gate.release.notified().await;
            }
        }
        (self.handler)(request)
    }
}

pub fn session() -> Arc<dyn Credentials> {
    Arc::new(StaticCredentials::new(
        SecretString::from("token-abc"),
        Identity { user_id: USER_ID.into(), name: "Ada".into(), avatar_url: None },
    ))
}

pub async fn app(backend: Arc<Backend>, blobs: Arc<dyn BlobStore>) -> AppStores {
    AppStores::new(backend, blobs, session(), StoreOptions::default()).await
}

pub fn post(id: &str, likes: u64) -> Value {
    json!({
        "_id": { "$oid": id },
        "content": format!("post {id}"),
        "author": { "_id": "author-1", "name": "Grace" },
        "likes": likes,
        "commentCount": 0,
        "createdAt": "2024-05-01T10:00:00Z",
    })
}

pub fn community_post(id: &str, community: &str, likes: u64) -> Value {
    let mut p = post(id, likes);
    p["community"] = json!({ "_id": community, "name": "Rustaceans" });
    p
}

pub fn page(ids: &[&str], page: u32, has_next: bool) -> Value {
    let posts: Vec<Value> = ids.iter().map(|id| post(id, 0)).collect();
    json!({
        "success": true,
        "body": {
            "posts": posts,
            "pagination": { "currentPage": page, "hasNextPage": has_next },
        },
    })
}
