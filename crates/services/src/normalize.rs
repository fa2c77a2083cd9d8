//! # Normalization Layer
//!
//! Pure functions turning whatever the backend sent into the canonical
//! records from `domains::models`. The backend has shipped several shapes for
//! the same data over the years; all of them stay readable:
//!
//! - ids: `_id: {"$oid": ..}`, `_id: "..."`, or `id`
//! - content: `content`, `description`, or the historical `discription`
//! - likes: a count, an array of liker ids or liker objects, or an object
//!   wrapping `users`/`likers` with an explicit `count`
//! - comments: a count, an array, or a dedicated `commentsList`
//! - envelopes: `{success, body, message}`, `{data}`, `{post: ..}` or bare
//!
//! Nothing here performs I/O. The ledger is passed in as a snapshot.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use domains::{
    AuthorRef, Comment, Community, CommunityRef, EntityCore, LikeState, PageMeta, PageParams,
    Post, Record, Role, ShowcaseEntry,
};
use serde_json::Value;
use tracing::debug;

/// Replies nested deeper than this are dropped.
pub const DEFAULT_MAX_COMMENT_DEPTH: usize = 8;

/// Inputs normalization needs besides the payload itself.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext<'a> {
    pub current_user_id: Option<&'a str>,
    /// Ids the like ledger marks as liked.
    pub ledger: Option<&'a BTreeSet<String>>,
    pub max_comment_depth: usize,
}

impl<'a> NormalizeContext<'a> {
    pub fn new(current_user_id: Option<&'a str>, ledger: Option<&'a BTreeSet<String>>) -> Self {
        Self { current_user_id, ledger, max_comment_depth: DEFAULT_MAX_COMMENT_DEPTH }
    }

    /// No user, no ledger.
    pub fn anonymous() -> Self {
        Self::new(None, None)
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_comment_depth = depth;
        self
    }

    fn ledger_marks(&self, entity_id: &str) -> bool {
        self.ledger.is_some_and(|l| l.contains(entity_id))
    }
}

/// Family records that can be built from a backend payload.
pub trait Normalize: Record {
    /// Returns `None` when the payload has no usable id.
    fn normalize(payload: &Value, cx: &NormalizeContext<'_>) -> Option<Self>;
}

// ── Field helpers ───────────────────────────────────────────────────────────

fn first_str<'v>(v: &'v Value, keys: &[&str]) -> Option<&'v str> {
    keys.iter()
        .filter_map(|k| v.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

fn first_u64(v: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| v.get(*k).and_then(as_count))
}

fn first_array<'v>(v: &'v Value, keys: &[&str]) -> Option<&'v Vec<Value>> {
    keys.iter().find_map(|k| v.get(*k).and_then(Value::as_array))
}

fn first_bool(v: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|k| v.get(*k).and_then(Value::as_bool))
}

/// Non-negative integer, tolerating floats like `6.0` some endpoints return.
fn as_count(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn scalar_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Canonical id: Mongo-style `_id` object, then flat `_id`, then `id`.
pub fn normalize_id(v: &Value) -> Option<String> {
    if let Some(raw) = v.get("_id") {
        if let Some(oid) = raw.get("$oid").and_then(scalar_id) {
            return Some(oid);
        }
        if let Some(id) = scalar_id(raw) {
            return Some(id);
        }
    }
    v.get("id").and_then(scalar_id)
}

/// `content`, else `description`, else the misspelled `discription`.
pub fn normalize_content(v: &Value) -> String {
    first_str(v, &["content", "description", "discription"])
        .unwrap_or_default()
        .to_string()
}

/// Accepts RFC 3339 strings, epoch milliseconds, and `{"$date": ..}`.
pub fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Object(map) => map.get("$date").and_then(parse_timestamp),
        _ => None,
    }
}

fn normalize_created_at(v: &Value) -> Option<DateTime<Utc>> {
    ["createdAt", "created_at", "timestamp", "date"]
        .iter()
        .find_map(|k| v.get(*k).and_then(parse_timestamp))
}

fn media_url(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(_) => first_str(v, &["url", "uri", "secure_url"]).map(str::to_string),
        _ => None,
    }
}

/// Ordered media URLs from arrays of strings or `{url}` objects.
pub fn normalize_media(v: &Value) -> Vec<String> {
    if let Some(items) = first_array(v, &["media", "images", "mediaUrls", "attachments"]) {
        return items.iter().filter_map(media_url).collect();
    }
    first_str(v, &["image", "imageUrl"])
        .map(|url| vec![url.to_string()])
        .unwrap_or_default()
}

// ── Author ──────────────────────────────────────────────────────────────────

fn author_from_object(v: &Value) -> Option<AuthorRef> {
    let id = normalize_id(v);
    let name = first_str(v, &["name", "username", "userName", "fullName", "displayName"]);
    if id.is_none() && name.is_none() {
        return None;
    }
    Some(AuthorRef {
        id: id.unwrap_or_default(),
        name: name.unwrap_or_default().to_string(),
        avatar_url: first_str(
            v,
            &["avatarUrl", "avatar", "profilePicture", "profileImage", "image"],
        )
        .map(str::to_string),
    })
}

/// Nested author object first, then flat `authorName`-style fields.
pub fn normalize_author(v: &Value) -> Option<AuthorRef> {
    let nested = ["author", "user", "createdBy", "postedBy", "creator"]
        .iter()
        .filter_map(|k| v.get(*k))
        .filter(|a| a.is_object())
        .find_map(author_from_object);
    if nested.is_some() {
        return nested;
    }

    // `user` sometimes holds just the id string.
    let id = first_str(v, &["authorId", "userId", "user", "createdBy"]);
    let name = first_str(v, &["authorName", "userName", "username"]);
    if id.is_none() && name.is_none() {
        return None;
    }
    Some(AuthorRef {
        id: id.unwrap_or_default().to_string(),
        name: name.unwrap_or_default().to_string(),
        avatar_url: first_str(v, &["authorAvatar", "userAvatar"]).map(str::to_string),
    })
}

// ── Likes ───────────────────────────────────────────────────────────────────

/// Whatever the payload said about likes, before overlaying the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedLikes {
    /// Explicit count, or the likers list length.
    pub count: Option<u64>,
    /// Liker ids when the payload listed them.
    pub likers: Option<Vec<String>>,
    /// Explicit `isLiked`-style flag.
    pub flag: Option<bool>,
}

impl ResolvedLikes {
    /// True when the server explicitly lists `user_id` among the likers.
    pub fn lists(&self, user_id: &str) -> bool {
        self.likers
            .as_ref()
            .is_some_and(|l| l.iter().any(|id| id == user_id))
    }
}

/// Id of one liker entry: a bare id, or an object carrying it somewhere.
pub fn liker_id(v: &Value) -> Option<String> {
    match v {
        Value::Object(_) => normalize_id(v)
            .or_else(|| v.get("userId").and_then(scalar_id))
            .or_else(|| v.get("user").and_then(liker_id)),
        other => scalar_id(other),
    }
}

fn likers_from(items: &[Value]) -> Vec<String> {
    items.iter().filter_map(liker_id).collect()
}

fn resolve_like_field(field: &Value, out: &mut ResolvedLikes) {
    match field {
        Value::Array(items) => {
            let likers = likers_from(items);
            out.count = Some(likers.len() as u64);
            out.likers = Some(likers);
        }
        Value::Object(_) => {
            if let Some(items) = first_array(field, &["users", "likers"]) {
                out.likers = Some(likers_from(items));
            }
            out.count = field
                .get("count")
                .and_then(as_count)
                .or_else(|| out.likers.as_ref().map(|l| l.len() as u64));
            out.flag = first_bool(field, &["likedByCurrentUser", "isLiked"]);
        }
        other => out.count = as_count(other),
    }
}

/// Reads every known like shape from an entity or a like-endpoint response.
pub fn resolve_likes(v: &Value) -> ResolvedLikes {
    let mut out = ResolvedLikes::default();
    if let Some(field) = v.get("likes").or_else(|| v.get("upvotes")) {
        resolve_like_field(field, &mut out);
    }
    if out.likers.is_none() {
        if let Some(items) = first_array(v, &["likedBy", "upvotedBy"]) {
            out.likers = Some(likers_from(items));
        }
    }
    if out.count.is_none() {
        out.count = first_u64(v, &["likeCount", "likesCount", "upvoteCount"])
            .or_else(|| out.likers.as_ref().map(|l| l.len() as u64));
    }
    if out.flag.is_none() {
        out.flag = first_bool(v, &["isLiked", "likedByCurrentUser", "hasLiked", "isUpvoted"]);
    }
    out
}

/// Canonical like pair. Liked when the server lists the user, the server
/// flags it, or the ledger marks it. The ledger can only add `true`.
pub fn normalize_likes(v: &Value, entity_id: &str, cx: &NormalizeContext<'_>) -> LikeState {
    let resolved = resolve_likes(v);
    let listed = cx.current_user_id.is_some_and(|uid| resolved.lists(uid));
    let liked = listed || resolved.flag == Some(true) || cx.ledger_marks(entity_id);
    LikeState::new(resolved.count.unwrap_or(0), liked)
}

// ── Comments ────────────────────────────────────────────────────────────────

fn normalize_comment_at(v: &Value, cx: &NormalizeContext<'_>, depth: usize) -> Option<Comment> {
    let id = normalize_id(v)?;
    let replies = match v.get("replies").and_then(Value::as_array) {
        Some(items) if depth < cx.max_comment_depth => items
            .iter()
            .filter_map(|r| normalize_comment_at(r, cx, depth + 1))
            .collect(),
        Some(items) => {
            debug!(comment = %id, dropped = items.len(), depth, "truncating nested replies");
            Vec::new()
        }
        None => Vec::new(),
    };
    Some(Comment {
        id,
        author: normalize_author(v),
        text: first_str(v, &["text", "content", "comment", "body"])
            .unwrap_or_default()
            .to_string(),
        created_at: normalize_created_at(v),
        replies,
    })
}

/// A single comment; its replies recurse up to `cx.max_comment_depth` levels.
pub fn normalize_comment(v: &Value, cx: &NormalizeContext<'_>) -> Option<Comment> {
    normalize_comment_at(v, cx, 1)
}

/// Comment counter plus the comment list when the payload carries one.
pub fn normalize_comments(v: &Value, cx: &NormalizeContext<'_>) -> (u64, Vec<Comment>) {
    let list = first_array(v, &["comments", "commentsList"]);
    let comments: Vec<Comment> = list
        .map(|items| items.iter().filter_map(|c| normalize_comment(c, cx)).collect())
        .unwrap_or_default();
    let count = first_u64(v, &["commentCount", "commentsCount"])
        .or_else(|| v.get("comments").and_then(as_count))
        .or_else(|| list.map(|items| items.len() as u64))
        .unwrap_or(0);
    (count, comments)
}

// ── Entities ────────────────────────────────────────────────────────────────

/// Fields shared by every family. `None` without an id.
pub fn normalize_core(v: &Value, cx: &NormalizeContext<'_>) -> Option<EntityCore> {
    let id = normalize_id(v)?;
    let (comment_count, comments) = normalize_comments(v, cx);
    Some(EntityCore {
        likes: normalize_likes(v, &id, cx),
        author: normalize_author(v),
        content: normalize_content(v),
        media: normalize_media(v),
        comment_count,
        comments,
        created_at: normalize_created_at(v),
        id,
    })
}

fn normalize_community_ref(v: &Value) -> Option<CommunityRef> {
    match v.get("community") {
        Some(c @ Value::Object(_)) => normalize_id(c).map(|id| CommunityRef {
            id,
            name: first_str(c, &["name", "title"]).map(str::to_string),
        }),
        Some(other) => scalar_id(other).map(|id| CommunityRef { id, name: None }),
        None => first_str(v, &["communityId"]).map(|id| CommunityRef {
            id: id.to_string(),
            name: None,
        }),
    }
}

impl Normalize for Post {
    fn normalize(payload: &Value, cx: &NormalizeContext<'_>) -> Option<Self> {
        Some(Post {
            core: normalize_core(payload, cx)?,
            community: normalize_community_ref(payload),
        })
    }
}

impl Normalize for ShowcaseEntry {
    fn normalize(payload: &Value, cx: &NormalizeContext<'_>) -> Option<Self> {
        Some(ShowcaseEntry {
            core: normalize_core(payload, cx)?,
            title: first_str(payload, &["title", "name", "projectName"])
                .unwrap_or_default()
                .to_string(),
            project_url: first_str(payload, &["projectUrl", "projectLink", "link"])
                .map(str::to_string),
            tags: payload
                .get("tags")
                .and_then(Value::as_array)
                .map(|t| t.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        })
    }
}

fn role_in_members(members: &[Value], user_id: &str) -> Option<Role> {
    members
        .iter()
        .find(|m| liker_id(m).as_deref() == Some(user_id))
        .and_then(|m| first_str(m, &["role"]))
        .and_then(Role::parse)
}

impl Normalize for Community {
    fn normalize(payload: &Value, cx: &NormalizeContext<'_>) -> Option<Self> {
        let members = payload.get("members").and_then(Value::as_array);
        let my_role = first_str(payload, &["myRole", "userRole", "role"])
            .and_then(Role::parse)
            .or_else(|| {
                let uid = cx.current_user_id?;
                role_in_members(members?, uid)
            });
        Some(Community {
            core: normalize_core(payload, cx)?,
            name: first_str(payload, &["name", "title"]).unwrap_or_default().to_string(),
            category: first_str(payload, &["category"]).map(str::to_string),
            member_count: first_u64(payload, &["memberCount", "membersCount"])
                .or_else(|| members.map(|m| m.len() as u64))
                .unwrap_or(0),
            my_role,
        })
    }
}

// ── Envelopes ───────────────────────────────────────────────────────────────

/// Peels `{body}`, `{data}` and `{<key>}` wrappers until the payload itself.
pub fn unwrap_envelope<'v>(v: &'v Value, key: &str) -> &'v Value {
    let mut current = v;
    // Envelopes nest at most a few levels; stop rather than loop on odd shapes.
    for _ in 0..4 {
        let inner = ["body", "data", key]
            .iter()
            .filter_map(|k| current.get(*k))
            .find(|inner| inner.is_object() || inner.is_array());
        match inner {
            Some(inner) => current = inner,
            None => break,
        }
    }
    current
}

/// `Some(message)` when the envelope reports `success: false`.
pub fn envelope_failure(v: &Value) -> Option<String> {
    if v.get("success").and_then(Value::as_bool) == Some(false) {
        let message = first_str(v, &["message", "error"]).unwrap_or("request failed");
        return Some(message.to_string());
    }
    None
}

/// The item list inside a list response, wherever the backend put it.
pub fn extract_list<'v>(v: &'v Value, plural_key: &str) -> &'v [Value] {
    let inner = unwrap_envelope(v, plural_key);
    if let Some(items) = inner.as_array() {
        return items;
    }
    first_array(inner, &[plural_key, "items", "results", "docs"])
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Pagination metadata from any of the places it has appeared.
pub fn extract_page_meta(v: &Value, requested: &PageParams, item_count: usize) -> PageMeta {
    let inner = unwrap_envelope(v, "pagination");
    let sources: Vec<&Value> = [Some(v), v.get("body"), Some(inner), v.get("pagination"), v.get("meta")]
        .into_iter()
        .flatten()
        .filter(|s| s.is_object())
        .collect();

    let page = sources
        .iter()
        .find_map(|s| first_u64(s, &["page", "currentPage"]))
        .and_then(|p| u32::try_from(p).ok())
        .unwrap_or(requested.page);
    let total = sources
        .iter()
        .find_map(|s| first_u64(s, &["total", "totalCount", "totalItems"]));
    let total_pages = sources.iter().find_map(|s| first_u64(s, &["totalPages", "pages"]));
    let has_next = sources
        .iter()
        .find_map(|s| first_bool(s, &["hasNextPage", "hasMore", "hasNext"]))
        .or_else(|| total_pages.map(|tp| u64::from(page) < tp))
        .unwrap_or(item_count as u32 >= requested.limit && item_count > 0);

    PageMeta { current_page: page, has_next, total }
}

/// Normalizes a list response, skipping items without an id.
pub fn normalize_list<R: Normalize>(v: &Value, cx: &NormalizeContext<'_>) -> Vec<R> {
    extract_list(v, R::PLURAL_KEY)
        .iter()
        .filter_map(|item| {
            let record = R::normalize(item, cx);
            if record.is_none() {
                debug!(key = R::PLURAL_KEY, "skipping list item without an id");
            }
            record
        })
        .collect()
}

/// Normalizes a single-record response such as a create confirmation.
pub fn normalize_single<R: Normalize>(v: &Value, cx: &NormalizeContext<'_>) -> Option<R> {
    R::normalize(unwrap_envelope(v, R::SINGULAR_KEY), cx)
}

/// The confirmed comment inside an add-comment response. Some endpoints
/// return the whole parent entity; the newest comment is taken from it then.
pub fn comment_from_response(
    v: &Value,
    parent_key: &str,
    cx: &NormalizeContext<'_>,
) -> Option<Comment> {
    let inner = unwrap_envelope(v, "comment");
    if first_str(inner, &["text", "content", "comment", "body"]).is_some() {
        if let Some(comment) = normalize_comment(inner, cx) {
            return Some(comment);
        }
    }
    let parent = unwrap_envelope(v, parent_key);
    first_array(parent, &["comments", "commentsList"])
        .and_then(|items| items.last())
        .and_then(|last| normalize_comment(last, cx))
}

/// Like data inside a like/unlike response.
pub fn likes_from_response(v: &Value, singular_key: &str) -> ResolvedLikes {
    let inner = unwrap_envelope(v, singular_key);
    let resolved = resolve_likes(inner);
    if resolved == ResolvedLikes::default() && !std::ptr::eq(inner, v) {
        return resolve_likes(v);
    }
    resolved
}
