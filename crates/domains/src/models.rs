//! # Domain Models
//!
//! Canonical in-memory shapes for every entity family the client caches.
//! Backend payloads never reach a store directly: they pass through the
//! normalization layer in `services` and come out as one of these records.
//!
//! Records serialize to camelCase JSON using the same field names the
//! normalizer reads, so a persisted record normalizes back to itself.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix marking client-generated ids that the server has not confirmed yet.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Generates a fresh pending id (e.g. `temp-5f0c…`).
pub fn temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

/// True when `id` was produced by [`temp_id`].
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// The families of cached entities. Each family owns one store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityFamily {
    /// Home-feed posts.
    Post,
    /// Posts listed inside a community.
    CommunityPost,
    Showcase,
    Community,
    /// The current user's follow graph.
    Follow,
}

impl EntityFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityFamily::Post => "post",
            EntityFamily::CommunityPost => "community-post",
            EntityFamily::Showcase => "showcase",
            EntityFamily::Community => "community",
            EntityFamily::Follow => "follow",
        }
    }

    /// Key under which the family's store persists its blob.
    pub fn storage_key(&self) -> &'static str {
        match self {
            EntityFamily::Post => "post-store",
            EntityFamily::CommunityPost => "community-post-store",
            EntityFamily::Showcase => "showcase-store",
            EntityFamily::Community => "community-store",
            EntityFamily::Follow => "follow-store",
        }
    }
}

impl fmt::Display for EntityFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Denormalized snapshot of a creator, embedded for render performance.
/// Not kept in sync after creation except on explicit re-fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorRef {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Like counter plus the current user's membership in the likers set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeState {
    pub count: u64,
    pub liked_by_current_user: bool,
}

impl LikeState {
    pub fn new(count: u64, liked_by_current_user: bool) -> Self {
        Self { count, liked_by_current_user }
    }

    /// Optimistic like. Returns false when already liked.
    pub fn apply_like(&mut self) -> bool {
        if self.liked_by_current_user {
            return false;
        }
        self.liked_by_current_user = true;
        self.count += 1;
        true
    }

    /// Optimistic unlike. Returns false when not liked.
    pub fn apply_unlike(&mut self) -> bool {
        if !self.liked_by_current_user {
            return false;
        }
        self.liked_by_current_user = false;
        self.count = self.count.saturating_sub(1);
        true
    }
}

/// A comment or reply. Replies nest to the depth the normalizer allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub author: Option<AuthorRef>,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<Comment>,
}

impl Comment {
    /// Placeholder shown while the server has not confirmed the comment.
    pub fn pending(author: Option<AuthorRef>, text: impl Into<String>) -> Self {
        Self {
            id: temp_id(),
            author,
            text: text.into(),
            created_at: Some(Utc::now()),
            replies: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        is_temp_id(&self.id)
    }
}

/// Fields shared by every cached family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCore {
    pub id: String,
    pub author: Option<AuthorRef>,
    pub content: String,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub likes: LikeState,
    #[serde(default)]
    pub comment_count: u64,
    #[serde(default)]
    pub comments: Vec<Comment>,
    pub created_at: Option<DateTime<Utc>>,
}

impl EntityCore {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: None,
            content: content.into(),
            media: Vec::new(),
            likes: LikeState::default(),
            comment_count: 0,
            comments: Vec::new(),
            created_at: None,
        }
    }
}

/// Lightweight reference to the community a post belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A feed post. The same logical post may live in the home feed and in a
/// community's post list at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(flatten)]
    pub core: EntityCore,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community: Option<CommunityRef>,
}

/// A project showcase entry. Likes on showcases are "upvotes" server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowcaseEntry {
    #[serde(flatten)]
    pub core: EntityCore,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Roles a user can hold inside a community, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Moderator,
    Admin,
    Owner,
}

impl Role {
    /// Parses the role names the backend has used over time.
    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "member" | "user" => Some(Role::Member),
            "moderator" | "mod" => Some(Role::Moderator),
            "admin" | "administrator" => Some(Role::Admin),
            "owner" | "creator" => Some(Role::Owner),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Member => "member",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
            Role::Owner => "owner",
        };
        f.write_str(name)
    }
}

/// A community. `content` carries the community description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Community {
    #[serde(flatten)]
    pub core: EntityCore,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub member_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_role: Option<Role>,
}

/// One (user, community) relation. Exactly one role per pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub community_id: String,
    pub user_id: String,
    pub role: Role,
}

/// Payload for optimistic creation. Family-specific fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Draft {
    pub fn new(content: impl Into<String>) -> Self {
        Self { content: content.into(), ..Default::default() }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn in_community(mut self, community_id: impl Into<String>) -> Self {
        self.community_id = Some(community_id.into());
        self
    }

    pub fn with_media(mut self, url: impl Into<String>) -> Self {
        self.media.push(url.into());
        self
    }
}

/// Who the client is acting as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Identity {
    pub fn to_author(&self) -> AuthorRef {
        AuthorRef {
            id: self.user_id.clone(),
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// Paging request for list fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageParams {
    pub page: u32,
    pub limit: u32,
    /// Replace the whole collection instead of appending.
    pub reset: bool,
    /// Parent resource the list is scoped to (e.g. a community id).
    pub scope: Option<String>,
}

impl PageParams {
    /// First page, replacing whatever is loaded.
    pub fn first(limit: u32) -> Self {
        Self { page: 1, limit, reset: true, scope: None }
    }

    /// The page following `meta`, appended to the collection.
    pub fn next(meta: &PageMeta, limit: u32) -> Self {
        Self { page: meta.current_page + 1, limit, reset: false, scope: None }
    }

    pub fn scoped(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// Pagination metadata kept next to a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub current_page: u32,
    pub has_next: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

/// Common surface over family records so one store implementation serves
/// every family.
pub trait Record:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Envelope key wrapping a single record, e.g. `{"post": {...}}`.
    const SINGULAR_KEY: &'static str;
    /// Envelope key wrapping a list, e.g. `{"posts": [...]}`.
    const PLURAL_KEY: &'static str;

    fn core(&self) -> &EntityCore;
    fn core_mut(&mut self) -> &mut EntityCore;

    /// Builds the optimistic record shown before the server answers.
    fn from_draft(
        id: String,
        author: Option<AuthorRef>,
        draft: &Draft,
        created_at: DateTime<Utc>,
    ) -> Self;

    fn id(&self) -> &str {
        &self.core().id
    }

    /// Parent resource the record's routes hang off, if any.
    fn scope(&self) -> Option<&str> {
        None
    }

    /// Attaches the parent a scoped list was fetched under. No-op for
    /// families without a parent.
    fn adopt_scope(&mut self, _scope: &str) {}
}

fn draft_core(
    id: String,
    author: Option<AuthorRef>,
    draft: &Draft,
    created_at: DateTime<Utc>,
) -> EntityCore {
    EntityCore {
        author,
        media: draft.media.clone(),
        created_at: Some(created_at),
        ..EntityCore::new(id, draft.content.clone())
    }
}

impl Record for Post {
    const SINGULAR_KEY: &'static str = "post";
    const PLURAL_KEY: &'static str = "posts";

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn from_draft(
        id: String,
        author: Option<AuthorRef>,
        draft: &Draft,
        created_at: DateTime<Utc>,
    ) -> Self {
        Post {
            core: draft_core(id, author, draft, created_at),
            community: draft
                .community_id
                .as_ref()
                .map(|id| CommunityRef { id: id.clone(), name: None }),
        }
    }

    fn scope(&self) -> Option<&str> {
        self.community.as_ref().map(|c| c.id.as_str())
    }

    fn adopt_scope(&mut self, scope: &str) {
        if self.community.is_none() {
            self.community = Some(CommunityRef { id: scope.to_string(), name: None });
        }
    }
}

impl Record for ShowcaseEntry {
    const SINGULAR_KEY: &'static str = "showcase";
    const PLURAL_KEY: &'static str = "showcases";

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn from_draft(
        id: String,
        author: Option<AuthorRef>,
        draft: &Draft,
        created_at: DateTime<Utc>,
    ) -> Self {
        ShowcaseEntry {
            core: draft_core(id, author, draft, created_at),
            title: draft.title.clone().unwrap_or_default(),
            project_url: draft.project_url.clone(),
            tags: draft.tags.clone(),
        }
    }
}

impl Record for Community {
    const SINGULAR_KEY: &'static str = "community";
    const PLURAL_KEY: &'static str = "communities";

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    // The creator owns the new community and is its first member.
    fn from_draft(
        id: String,
        author: Option<AuthorRef>,
        draft: &Draft,
        created_at: DateTime<Utc>,
    ) -> Self {
        Community {
            core: draft_core(id, author, draft, created_at),
            name: draft.title.clone().unwrap_or_default(),
            category: draft.category.clone(),
            member_count: 1,
            my_role: Some(Role::Owner),
        }
    }
}
