//! # Endpoint Candidates
//!
//! The backend's routes were renamed several times without the old ones
//! being retired consistently. Instead of hard-coding one guess per call
//! site, each `(family, operation)` pair owns an ordered list of candidate
//! request shapes that the [`Prober`](crate::probe::Prober) walks through.
//!
//! The table is plain data: adding or reordering a variant never touches
//! store code.

use std::collections::HashMap;
use std::fmt;

use domains::{ApiRequest, EntityFamily, PageParams};
use once_cell::sync::Lazy;
use serde_json::Value;

/// Logical operations a store performs against the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Fetch,
    Create,
    Delete,
    Like,
    Unlike,
    AddComment,
    DeleteComment,
    Join,
    Leave,
    FetchMembers,
    UpdateRole,
    Follow,
    Unfollow,
    FetchFollowing,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Fetch => "fetch",
            Operation::Create => "create",
            Operation::Delete => "delete",
            Operation::Like => "like",
            Operation::Unlike => "unlike",
            Operation::AddComment => "add-comment",
            Operation::DeleteComment => "delete-comment",
            Operation::Join => "join",
            Operation::Leave => "leave",
            Operation::FetchMembers => "fetch-members",
            Operation::UpdateRole => "update-role",
            Operation::Follow => "follow",
            Operation::Unfollow => "unfollow",
            Operation::FetchFollowing => "fetch-following",
        };
        f.write_str(name)
    }
}

/// Everything a candidate needs to build its request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    pub entity_id: String,
    /// Parent resource, e.g. the community a post lives in.
    pub scope: Option<String>,
    /// Secondary id: a comment, a member, or a followed user.
    pub target_id: Option<String>,
    pub user_id: Option<String>,
    pub body: Option<Value>,
    pub page: Option<PageParams>,
}

impl RequestContext {
    pub fn for_entity(id: impl Into<String>) -> Self {
        Self { entity_id: id.into(), ..Default::default() }
    }

    pub fn for_page(params: PageParams) -> Self {
        Self { scope: params.scope.clone(), page: Some(params), ..Default::default() }
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_id = Some(target.into());
        self
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user_id = user;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    fn scope_or_blank(&self) -> &str {
        self.scope.as_deref().unwrap_or_default()
    }

    fn target_or_blank(&self) -> &str {
        self.target_id.as_deref().unwrap_or_default()
    }

    fn page_query(&self) -> String {
        match &self.page {
            Some(p) => format!("?page={}&limit={}", p.page, p.limit),
            None => String::new(),
        }
    }

    fn body_or_empty(&self) -> Value {
        self.body.clone().unwrap_or_else(|| Value::Object(Default::default()))
    }
}

pub type BuildRequest = fn(&RequestContext) -> ApiRequest;

/// One guessed request shape.
#[derive(Clone, Copy)]
pub struct Candidate {
    pub name: &'static str,
    pub build: BuildRequest,
}

impl Candidate {
    pub const fn new(name: &'static str, build: BuildRequest) -> Self {
        Self { name, build }
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Candidate").field(&self.name).finish()
    }
}

/// Ordered candidates per `(family, operation)`.
#[derive(Debug, Clone, Default)]
pub struct CandidateTable {
    entries: HashMap<(EntityFamily, Operation), Vec<Candidate>>,
}

impl CandidateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the candidates for one pair. Order is preference order.
    pub fn with(mut self, family: EntityFamily, op: Operation, candidates: Vec<Candidate>) -> Self {
        self.entries.insert((family, op), candidates);
        self
    }

    pub fn candidates(&self, family: EntityFamily, op: Operation) -> &[Candidate] {
        self.entries
            .get(&(family, op))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The routes the production backend is known to answer on.
    pub fn standard() -> Self {
        STANDARD_CANDIDATES.clone()
    }
}

static STANDARD_CANDIDATES: Lazy<CandidateTable> = Lazy::new(|| {
    use EntityFamily::*;
    use Operation::*;

    CandidateTable::new()
        // ── Home feed posts ─────────────────────────────────────────────────
        .with(Post, Fetch, vec![
            Candidate::new("posts.list", |cx| ApiRequest::get(format!("/posts{}", cx.page_query()))),
            Candidate::new("posts.feed", |cx| ApiRequest::get(format!("/posts/feed{}", cx.page_query()))),
        ])
        .with(Post, Create, vec![
            Candidate::new("posts.create", |cx| ApiRequest::post("/posts").with_body(cx.body_or_empty())),
        ])
        .with(Post, Delete, vec![
            Candidate::new("posts.delete", |cx| ApiRequest::delete(format!("/posts/{}", cx.entity_id))),
            Candidate::new("posts.delete-legacy", |cx| ApiRequest::delete(format!("/posts/delete/{}", cx.entity_id))),
        ])
        .with(Post, Like, vec![
            Candidate::new("posts.like", |cx| ApiRequest::post(format!("/posts/{}/like", cx.entity_id))),
        ])
        .with(Post, Unlike, vec![
            Candidate::new("posts.unlike", |cx| ApiRequest::delete(format!("/posts/{}/like", cx.entity_id))),
            Candidate::new("posts.unlike-post", |cx| ApiRequest::post(format!("/posts/{}/unlike", cx.entity_id))),
        ])
        .with(Post, AddComment, vec![
            Candidate::new("posts.comment", |cx| {
                ApiRequest::post(format!("/posts/{}/comments", cx.entity_id)).with_body(cx.body_or_empty())
            }),
            Candidate::new("posts.comment-legacy", |cx| {
                ApiRequest::post(format!("/posts/comment/{}", cx.entity_id)).with_body(cx.body_or_empty())
            }),
        ])
        .with(Post, DeleteComment, vec![
            Candidate::new("posts.delete-comment", |cx| {
                ApiRequest::delete(format!("/posts/{}/comments/{}", cx.entity_id, cx.target_or_blank()))
            }),
        ])
        // ── Community posts ─────────────────────────────────────────────────
        .with(CommunityPost, Fetch, vec![
            Candidate::new("community-posts.list", |cx| {
                ApiRequest::get(format!("/communities/{}/posts{}", cx.scope_or_blank(), cx.page_query()))
            }),
        ])
        .with(CommunityPost, Create, vec![
            Candidate::new("community-posts.create", |cx| {
                ApiRequest::post(format!("/communities/{}/posts", cx.scope_or_blank())).with_body(cx.body_or_empty())
            }),
        ])
        .with(CommunityPost, Delete, vec![
            Candidate::new("community-posts.delete", |cx| {
                ApiRequest::delete(format!("/communities/{}/posts/{}", cx.scope_or_blank(), cx.entity_id))
            }),
            Candidate::new("community-posts.delete-flat", |cx| ApiRequest::delete(format!("/posts/{}", cx.entity_id))),
        ])
        .with(CommunityPost, Like, vec![
            Candidate::new("community-posts.like", |cx| {
                ApiRequest::post(format!("/communities/{}/posts/{}/like", cx.scope_or_blank(), cx.entity_id))
            }),
            Candidate::new("community-posts.like-flat", |cx| ApiRequest::post(format!("/posts/{}/like", cx.entity_id))),
            Candidate::new("community-posts.like-put", |cx| {
                ApiRequest::put(format!("/community-posts/{}/like", cx.entity_id))
            }),
        ])
        .with(CommunityPost, Unlike, vec![
            Candidate::new("community-posts.unlike", |cx| {
                ApiRequest::delete(format!("/communities/{}/posts/{}/like", cx.scope_or_blank(), cx.entity_id))
            }),
            Candidate::new("community-posts.unlike-flat", |cx| ApiRequest::post(format!("/posts/{}/unlike", cx.entity_id))),
            Candidate::new("community-posts.unlike-delete", |cx| {
                ApiRequest::delete(format!("/community-posts/{}/like", cx.entity_id))
            }),
        ])
        .with(CommunityPost, AddComment, vec![
            Candidate::new("community-posts.comment", |cx| {
                ApiRequest::post(format!("/communities/{}/posts/{}/comments", cx.scope_or_blank(), cx.entity_id))
                    .with_body(cx.body_or_empty())
            }),
            Candidate::new("community-posts.comment-flat", |cx| {
                ApiRequest::post(format!("/posts/{}/comments", cx.entity_id)).with_body(cx.body_or_empty())
            }),
            Candidate::new("community-posts.comment-legacy", |cx| {
                ApiRequest::post(format!("/community-posts/{}/comment", cx.entity_id)).with_body(cx.body_or_empty())
            }),
        ])
        .with(CommunityPost, DeleteComment, vec![
            Candidate::new("community-posts.delete-comment", |cx| {
                ApiRequest::delete(format!(
                    "/communities/{}/posts/{}/comments/{}",
                    cx.scope_or_blank(),
                    cx.entity_id,
                    cx.target_or_blank()
                ))
            }),
            Candidate::new("community-posts.delete-comment-flat", |cx| {
                ApiRequest::delete(format!("/posts/{}/comments/{}", cx.entity_id, cx.target_or_blank()))
            }),
        ])
        // ── Showcases (likes are "upvotes") ─────────────────────────────────
        .with(Showcase, Fetch, vec![
            Candidate::new("showcase.list", |cx| ApiRequest::get(format!("/showcase{}", cx.page_query()))),
        ])
        .with(Showcase, Create, vec![
            Candidate::new("showcase.create", |cx| ApiRequest::post("/showcase").with_body(cx.body_or_empty())),
        ])
        .with(Showcase, Delete, vec![
            Candidate::new("showcase.delete", |cx| ApiRequest::delete(format!("/showcase/{}", cx.entity_id))),
            Candidate::new("showcase.delete-legacy", |cx| ApiRequest::delete(format!("/showcase/delete/{}", cx.entity_id))),
        ])
        .with(Showcase, Like, vec![
            Candidate::new("showcase.upvote", |cx| ApiRequest::post(format!("/showcase/{}/upvote", cx.entity_id))),
            Candidate::new("showcase.upvote-put", |cx| ApiRequest::put(format!("/showcase/upvote/{}", cx.entity_id))),
            Candidate::new("showcase.like", |cx| ApiRequest::post(format!("/showcase/{}/like", cx.entity_id))),
        ])
        .with(Showcase, Unlike, vec![
            Candidate::new("showcase.remove-upvote", |cx| {
                ApiRequest::delete(format!("/showcase/{}/upvote", cx.entity_id))
            }),
            Candidate::new("showcase.remove-upvote-put", |cx| {
                ApiRequest::put(format!("/showcase/remove-upvote/{}", cx.entity_id))
            }),
            Candidate::new("showcase.unlike", |cx| ApiRequest::post(format!("/showcase/{}/unlike", cx.entity_id))),
        ])
        .with(Showcase, AddComment, vec![
            Candidate::new("showcase.comment", |cx| {
                ApiRequest::post(format!("/showcase/{}/comments", cx.entity_id)).with_body(cx.body_or_empty())
            }),
            Candidate::new("showcase.comment-legacy", |cx| {
                ApiRequest::post(format!("/showcase/comment/{}", cx.entity_id)).with_body(cx.body_or_empty())
            }),
            Candidate::new("showcase.comment-put", |cx| {
                ApiRequest::put(format!("/showcase/{}/comment", cx.entity_id)).with_body(cx.body_or_empty())
            }),
        ])
        .with(Showcase, DeleteComment, vec![
            Candidate::new("showcase.delete-comment", |cx| {
                ApiRequest::delete(format!("/showcase/{}/comments/{}", cx.entity_id, cx.target_or_blank()))
            }),
        ])
        // ── Communities ─────────────────────────────────────────────────────
        .with(Community, Fetch, vec![
            Candidate::new("communities.list", |cx| ApiRequest::get(format!("/communities{}", cx.page_query()))),
        ])
        .with(Community, Create, vec![
            Candidate::new("communities.create", |cx| ApiRequest::post("/communities").with_body(cx.body_or_empty())),
        ])
        .with(Community, Delete, vec![
            Candidate::new("communities.delete", |cx| ApiRequest::delete(format!("/communities/{}", cx.entity_id))),
        ])
        .with(Community, Join, vec![
            Candidate::new("communities.join", |cx| ApiRequest::post(format!("/communities/{}/join", cx.entity_id))),
            Candidate::new("communities.join-legacy", |cx| ApiRequest::post(format!("/communities/join/{}", cx.entity_id))),
        ])
        .with(Community, Leave, vec![
            Candidate::new("communities.leave", |cx| ApiRequest::post(format!("/communities/{}/leave", cx.entity_id))),
            Candidate::new("communities.remove-member", |cx| {
                ApiRequest::delete(format!(
                    "/communities/{}/members/{}",
                    cx.entity_id,
                    cx.user_id.as_deref().unwrap_or_default()
                ))
            }),
        ])
        .with(Community, FetchMembers, vec![
            Candidate::new("communities.members", |cx| ApiRequest::get(format!("/communities/{}/members", cx.entity_id))),
        ])
        .with(Community, UpdateRole, vec![
            Candidate::new("communities.member-role", |cx| {
                ApiRequest::put(format!("/communities/{}/members/{}/role", cx.entity_id, cx.target_or_blank()))
                    .with_body(cx.body_or_empty())
            }),
        ])
        // ── Follow graph ────────────────────────────────────────────────────
        .with(EntityFamily::Follow, Operation::Follow, vec![
            Candidate::new("users.follow", |cx| ApiRequest::post(format!("/users/{}/follow", cx.entity_id))),
            Candidate::new("follow.legacy", |cx| ApiRequest::post(format!("/follow/{}", cx.entity_id))),
        ])
        .with(EntityFamily::Follow, Unfollow, vec![
            Candidate::new("users.unfollow", |cx| ApiRequest::delete(format!("/users/{}/follow", cx.entity_id))),
            Candidate::new("unfollow.legacy", |cx| ApiRequest::post(format!("/unfollow/{}", cx.entity_id))),
        ])
        .with(EntityFamily::Follow, FetchFollowing, vec![
            Candidate::new("users.following", |cx| ApiRequest::get(format!("/users/{}/following", cx.entity_id))),
        ])
});
