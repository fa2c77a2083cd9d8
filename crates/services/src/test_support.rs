//! Fixtures shared by the unit tests of this crate.

use std::sync::Arc;

use domains::{BlobStore, Credentials, Identity, MockCredentials, MockRemoteTransport};
use serde_json::{json, Value};

use crate::bus::SyncBus;
use crate::endpoints::CandidateTable;
use crate::probe::Prober;
use crate::stores::StoreDeps;

pub const USER_ID: &str = "user-1";

/// A logged-in session for `user-1`.
pub fn session() -> Arc<dyn Credentials> {
    let mut creds = MockCredentials::new();
    creds.expect_token().returning(|| Some("token-abc".into()));
    creds.expect_identity().returning(|| {
        Some(Identity { user_id: USER_ID.into(), name: "Ada".into(), avatar_url: None })
    });
    Arc::new(creds)
}

pub fn deps_with(
    transport: MockRemoteTransport,
    blobs: Arc<dyn BlobStore>,
    credentials: Arc<dyn Credentials>,
) -> StoreDeps {
    let prober = Prober::new(Arc::new(transport), Arc::new(CandidateTable::standard()));
    StoreDeps::new(Arc::new(prober), blobs, credentials, Arc::new(SyncBus::new()))
}

/// A post the way the current backend sends it.
pub fn post_json(id: &str, likes: u64, likers: &[&str]) -> Value {
    let mut post = json!({
        "_id": { "$oid": id },
        "content": format!("post {id}"),
        "author": { "_id": "author-1", "name": "Grace" },
        "commentCount": 0,
        "createdAt": "2024-05-01T10:00:00Z",
    });
    if likers.is_empty() {
        post["likes"] = json!(likes);
    } else {
        post["likes"] = json!(likers);
    }
    post
}

pub fn page_body(ids: &[&str], page: u32, has_next: bool) -> Value {
    let posts: Vec<Value> = ids.iter().map(|id| post_json(id, 0, &[])).collect();
    json!({
        "success": true,
        "posts": posts,
        "pagination": { "page": page, "hasNextPage": has_next },
    })
}
