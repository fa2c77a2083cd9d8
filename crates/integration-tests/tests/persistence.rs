//! State that must survive a restart, backed by files in a temp directory.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{app, page, post, Backend, USER_ID};
use domains::{ApiResponse, BlobStore, LikeState, PageParams, Role};
use serde_json::json;
use services::AppStores;
use storage_adapters::FileBlobStore;
use tempfile::TempDir;
use tokio_test::assert_ok;

async fn open(dir: &Path, backend: Arc<Backend>) -> AppStores {
    let blobs = Arc::new(FileBlobStore::open(dir).await.unwrap());
    let app = app(backend, blobs).await;
    app.rehydrate().await.unwrap();
    app
}

#[tokio::test]
async fn like_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let backend = Arc::new(Backend::new(|_| Ok(ApiResponse::json(200, json!({ "likes": 6 })))));
        let app = open(dir.path(), backend).await;
        assert_ok!(app.posts.upsert_payload(&post("post-7", 5)).await);
        assert_ok!(app.posts.like("post-7").await);
    }

    let app = open(dir.path(), Arc::new(Backend::offline())).await;

    let post = app.posts.get("post-7").await.unwrap();
    assert_eq!(post.core.likes, LikeState::new(6, true));
    assert!(app.post_ledger.is_marked("post-7").await);
}

#[tokio::test]
async fn ledger_overrides_payload_without_like_flag() {
    let dir = TempDir::new().unwrap();
    {
        let app = open(dir.path(), Arc::new(Backend::status(200))).await;
        assert_ok!(app.posts.upsert_payload(&post("p2", 3)).await);
        assert_ok!(app.posts.like("p2").await);
    }

    // The feed endpoint does not say who liked what
    let backend = Arc::new(Backend::new(|_| Ok(ApiResponse::json(200, page(&["p1", "p2"], 1, false)))));
    let app = open(dir.path(), backend).await;
    assert_ok!(app.posts.fetch_all(PageParams::first(20)).await);

    assert!(app.posts.get("p2").await.unwrap().core.likes.liked_by_current_user);
    assert!(!app.posts.get("p1").await.unwrap().core.likes.liked_by_current_user);
    // The community view shares the ledger
    assert_ok!(
        app.community_posts
            .upsert_payload(&common::community_post("p2", "c1", 4))
            .await
    );
    assert!(app.community_posts.get("p2").await.unwrap().core.likes.liked_by_current_user);
}

#[tokio::test]
async fn incompatible_blob_starts_empty() {
    let dir = TempDir::new().unwrap();
    let blobs = FileBlobStore::open(dir.path()).await.unwrap();
    assert_ok!(
        blobs
            .save("post-store", json!({ "version": 99, "state": { "items": "?" } }).to_string())
            .await
    );
    assert_ok!(blobs.save("post-like-ledger", "not json at all".into()).await);

    let app = open(dir.path(), Arc::new(Backend::offline())).await;

    assert!(app.posts.is_empty().await);
    assert!(app.post_ledger.snapshot().await.is_empty());
}

#[tokio::test]
async fn memberships_and_follows_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let backend = Arc::new(Backend::new(|req| {
            let body = if req.path.contains("/join") {
                json!({ "success": true, "role": "moderator" })
            } else {
                json!({ "success": true })
            };
            Ok(ApiResponse::json(200, body))
        }));
        let app = open(dir.path(), backend).await;
        assert_ok!(
            app.communities
                .entities()
                .upsert_payload(&json!({ "_id": "c1", "name": "Rustaceans", "memberCount": 10 }))
                .await
        );
        assert_eq!(assert_ok!(app.communities.join("c1").await), Role::Moderator);
        assert_ok!(app.follows.follow("user-9").await);
    }

    let app = open(dir.path(), Arc::new(Backend::offline())).await;

    let community = app.communities.get("c1").await.unwrap();
    assert_eq!(community.my_role, Some(Role::Moderator));
    assert_eq!(community.member_count, 11);
    assert_eq!(app.communities.role_of("c1", USER_ID).await, Some(Role::Moderator));
    assert!(app.follows.is_following("user-9").await);
}

#[tokio::test]
async fn logout_removes_persisted_state() {
    let dir = TempDir::new().unwrap();
    {
        let app = open(dir.path(), Arc::new(Backend::status(200))).await;
        assert_ok!(app.posts.upsert_payload(&post("p1", 0)).await);
        assert_ok!(app.posts.like("p1").await);
        app.logout().await;
    }

    let app = open(dir.path(), Arc::new(Backend::offline())).await;

    assert!(app.posts.is_empty().await);
    assert!(!app.post_ledger.is_marked("p1").await);
}
