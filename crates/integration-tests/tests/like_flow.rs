//! Optimistic like/unlike against a scripted backend.

mod common;

use std::sync::Arc;

use common::{app, community_post, post, Backend};
use domains::{ApiResponse, LikeState, SyncError};
use serde_json::json;
use storage_adapters::MemoryBlobStore;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn like_applies_immediately_and_adopts_server_count() {
    let backend = Arc::new(Backend::new(|_| Ok(ApiResponse::json(200, json!({ "likes": 6 })))));
    let app = app(backend.clone(), Arc::new(MemoryBlobStore::new())).await;
    assert_ok!(app.posts.upsert_payload(&post("post-7", 5)).await);

    let likes = assert_ok!(app.posts.like("post-7").await);

    assert_eq!(likes, LikeState::new(6, true));
    assert!(app.post_ledger.is_marked("post-7").await);
    assert_eq!(backend.calls(), ["POST /posts/post-7/like"]);
}

#[tokio::test]
async fn like_rolls_back_when_every_candidate_fails() {
    let backend = Arc::new(Backend::offline());
    let app = app(backend, Arc::new(MemoryBlobStore::new())).await;
    assert_ok!(app.posts.upsert_payload(&post("post-7", 5)).await);

    let err = assert_err!(app.posts.like("post-7").await);

    assert!(matches!(err, SyncError::Transport(_)));
    let post = app.posts.get("post-7").await.unwrap();
    assert_eq!(post.core.likes, LikeState::new(5, false));
    assert!(!app.post_ledger.is_marked("post-7").await);
    assert!(app.posts.error().await.is_some());
}

#[tokio::test]
async fn double_like_sends_one_request() {
    let backend = Arc::new(Backend::status(200));
    let app = app(backend.clone(), Arc::new(MemoryBlobStore::new())).await;
    assert_ok!(app.posts.upsert_payload(&post("post-7", 5)).await);

    assert_ok!(app.posts.like("post-7").await);
    let again = assert_ok!(app.posts.like("post-7").await);

    assert_eq!(again, LikeState::new(6, true));
    assert_eq!(backend.calls().len(), 1);
}

#[tokio::test]
async fn unlike_failure_restores_liked_state_and_ledger() {
    let backend = Arc::new(Backend::new(|req| {
        if req.to_string() == "POST /posts/post-7/like" {
            Ok(ApiResponse::empty(200))
        } else {
            Ok(ApiResponse::json(503, json!({ "message": "maintenance" })))
        }
    }));
    let app = app(backend.clone(), Arc::new(MemoryBlobStore::new())).await;
    assert_ok!(app.posts.upsert_payload(&post("post-7", 5)).await);
    assert_ok!(app.posts.like("post-7").await);

    let err = assert_err!(app.posts.unlike("post-7").await);

    assert!(matches!(err, SyncError::Http { status: 503, .. }));
    assert_eq!(
        backend.calls(),
        ["POST /posts/post-7/like", "DELETE /posts/post-7/like", "POST /posts/post-7/unlike"]
    );
    let post = app.posts.get("post-7").await.unwrap();
    assert_eq!(post.core.likes, LikeState::new(6, true));
    assert!(app.post_ledger.is_marked("post-7").await);
    assert_eq!(app.metrics().rollback_count("post"), 1);
}

#[tokio::test]
async fn unlike_rollback_when_all_variants_fail() {
    let backend = Arc::new(Backend::new(|req| {
        if req.path.ends_with("/like") && req.method == domains::Method::Post {
            Ok(ApiResponse::empty(200))
        } else {
            Ok(ApiResponse::empty(404))
        }
    }));
    let app = app(backend, Arc::new(MemoryBlobStore::new())).await;
    assert_ok!(app.posts.upsert_payload(&post("post-7", 5)).await);
    assert_ok!(app.posts.like("post-7").await);

    let err = assert_err!(app.posts.unlike("post-7").await);

    assert!(err.is_endpoint_not_found());
    let post = app.posts.get("post-7").await.unwrap();
    assert_eq!(post.core.likes, LikeState::new(6, true));
    assert!(app.post_ledger.is_marked("post-7").await);
}

#[tokio::test]
async fn stale_like_response_is_discarded() {
    let (backend, gate) = Backend::new(|req| {
        let count = if req.method == domains::Method::Post { 6 } else { 5 };
        Ok(ApiResponse::json(200, json!({ "likes": count })))
    })
    .gated("POST /posts/post-7/like");
    let backend = Arc::new(backend);
    let app = Arc::new(app(backend, Arc::new(MemoryBlobStore::new())).await);
    assert_ok!(app.posts.upsert_payload(&post("post-7", 5)).await);

    // 1. Like goes out and hangs
    let pending = {
        let app = app.clone();
        tokio::spawn(async move { app.posts.like("post-7").await })
    };
    gate.arrived.notified().await;

    // 2. Unlike overtakes it and completes
    let unliked = assert_ok!(app.posts.unlike("post-7").await);
    assert_eq!(unliked, LikeState::new(5, false));

    // 3. The late like response must not resurrect the like
    gate.release.notify_one();
    assert_ok!(pending.await.unwrap());

    let post = app.posts.get("post-7").await.unwrap();
    assert_eq!(post.core.likes, LikeState::new(5, false));
    assert!(!app.post_ledger.is_marked("post-7").await);
    assert_eq!(app.metrics().stale_count("post"), 1);
}

#[tokio::test]
async fn community_like_mirrors_into_home_feed() {
    let backend = Arc::new(Backend::new(|_| Ok(ApiResponse::json(200, json!({ "likeCount": 3 })))));
    let app = app(backend.clone(), Arc::new(MemoryBlobStore::new())).await;
    assert_ok!(app.posts.upsert_payload(&post("p1", 2)).await);
    assert_ok!(app.community_posts.upsert_payload(&community_post("p1", "c1", 2)).await);

    assert_ok!(app.community_posts.like("p1").await);

    assert_eq!(backend.calls(), ["POST /communities/c1/posts/p1/like"]);
    let home = app.posts.get("p1").await.unwrap();
    assert_eq!(home.core.likes, LikeState::new(3, true));
}

#[tokio::test]
async fn mirrored_like_survives_failed_feed_like_in_flight() {
    let (backend, gate) = Backend::new(|req| {
        if req.path.starts_with("/communities/") {
            Ok(ApiResponse::json(200, json!({ "likeCount": 3 })))
        } else {
            Ok(ApiResponse::json(500, json!({ "message": "write failed" })))
        }
    })
    .gated("POST /posts/p1/like");
    let backend = Arc::new(backend);
    let app = Arc::new(app(backend.clone(), Arc::new(MemoryBlobStore::new())).await);
    assert_ok!(app.posts.upsert_payload(&post("p1", 2)).await);
    assert_ok!(app.community_posts.upsert_payload(&community_post("p1", "c1", 2)).await);

    // 1. Feed like goes out and hangs
    let pending = {
        let app = app.clone();
        tokio::spawn(async move { app.posts.like("p1").await })
    };
    gate.arrived.notified().await;

    // 2. The community view confirms the same like and mirrors it
    assert_ok!(app.community_posts.like("p1").await);

    // 3. The feed request fails late; its rollback must not undo the mirror
    gate.release.notify_one();
    let err = assert_err!(pending.await.unwrap());

    assert!(matches!(err, SyncError::Http { status: 500, .. }));
    assert_eq!(app.posts.get("p1").await.unwrap().core.likes, LikeState::new(3, true));
    assert!(app.post_ledger.is_marked("p1").await);
    assert_eq!(app.metrics().stale_count("post"), 1);
    assert_eq!(app.metrics().rollback_count("post"), 0);
    assert_eq!(
        backend.calls(),
        ["POST /posts/p1/like", "POST /communities/c1/posts/p1/like"]
    );
}

#[tokio::test]
async fn showcase_upvote_falls_through_to_second_variant() {
    let backend = Arc::new(Backend::new(|req| match req.path.as_str() {
        "/showcase/upvote/s1" => Ok(ApiResponse::json(200, json!({ "upvotes": 9 }))),
        _ => Ok(ApiResponse::empty(404)),
    }));
    let app = app(backend.clone(), Arc::new(MemoryBlobStore::new())).await;
    assert_ok!(
        app.showcases
            .upsert_payload(&json!({ "_id": "s1", "title": "Ferris", "upvotes": 8 }))
            .await
    );

    let likes = assert_ok!(app.showcases.like("s1").await);

    assert_eq!(likes, LikeState::new(9, true));
    assert_eq!(backend.calls(), ["POST /showcase/s1/upvote", "PUT /showcase/upvote/s1"]);
    assert!(app.showcase_ledger.is_marked("s1").await);
    assert!(!app.post_ledger.is_marked("s1").await);
}
