//! # Entity Store
//!
//! One generic store serves posts, community posts and showcases (and backs
//! the community store). Each instance owns a single family's collection,
//! its pagination metadata and a store-local `error` field.
//!
//! Mutations are optimistic: local state changes first, then the backend is
//! asked to confirm through the [`Prober`](crate::probe::Prober). Like
//! confirmations and rollbacks are guarded by a per-entity generation so a
//! late response never overwrites a newer toggle.
//!
//! # Developer Note
//! The state lock is never held across a network await. Every public
//! operation takes the lock in short, separate sections.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use domains::{
    is_temp_id, temp_id, BlobStore, Comment, Credentials, Draft, EntityFamily, LikeState,
    PageMeta, PageParams, Record, Result, SyncError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bus::{Mirror, MirrorChange, MirrorEvent, SyncBus};
use crate::endpoints::{Operation, RequestContext};
use crate::ledger::Ledger;
use crate::metrics::SyncMetrics;
use crate::normalize::{
    comment_from_response, extract_list, extract_page_meta, likes_from_response, normalize_list,
    normalize_single, Normalize, NormalizeContext, DEFAULT_MAX_COMMENT_DEPTH,
};
use crate::persist::{load_versioned, save_versioned};
use crate::probe::Prober;

const STORE_VERSION: u32 = 1;

/// Collaborators shared by every store.
#[derive(Clone)]
pub struct StoreDeps {
    pub prober: Arc<Prober>,
    pub blobs: Arc<dyn BlobStore>,
    pub credentials: Arc<dyn Credentials>,
    pub bus: Arc<SyncBus>,
    pub metrics: SyncMetrics,
    pub max_comment_depth: usize,
}

impl StoreDeps {
    pub fn new(
        prober: Arc<Prober>,
        blobs: Arc<dyn BlobStore>,
        credentials: Arc<dyn Credentials>,
        bus: Arc<SyncBus>,
    ) -> Self {
        let metrics = prober.metrics().clone();
        Self {
            prober,
            blobs,
            credentials,
            bus,
            metrics,
            max_comment_depth: DEFAULT_MAX_COMMENT_DEPTH,
        }
    }

    pub fn with_max_comment_depth(mut self, depth: usize) -> Self {
        self.max_comment_depth = depth;
        self
    }

    pub(crate) fn current_user_id(&self) -> Option<String> {
        self.credentials.identity().map(|i| i.user_id)
    }

    pub(crate) fn has_session(&self) -> bool {
        self.credentials.token().is_some()
    }
}

/// Result of [`EntityStore::fetch_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// `received` items normalized, `added` of them are new to the collection.
    Loaded { received: usize, added: usize },
    /// Another fetch was already running; nothing was requested.
    Skipped,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedCollection<R> {
    items: Vec<R>,
    page: PageMeta,
}

struct StoreState<R> {
    items: Vec<R>,
    page: PageMeta,
    error: Option<String>,
    /// Bumped on every optimistic like toggle. Not persisted.
    generations: HashMap<String, u64>,
}

impl<R> Default for StoreState<R> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            page: PageMeta::default(),
            error: None,
            generations: HashMap::new(),
        }
    }
}

impl<R: Record> StoreState<R> {
    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|r| r.id() == id)
    }

    fn find(&self, id: &str) -> Option<&R> {
        self.items.iter().find(|r| r.id() == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut R> {
        self.items.iter_mut().find(|r| r.id() == id)
    }

    fn bump_generation(&mut self, id: &str) -> u64 {
        let generation = self.generations.entry(id.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    fn is_current(&self, id: &str, generation: u64) -> bool {
        self.generations.get(id) == Some(&generation)
    }

    /// Replaces the record with the same id, or inserts at the head.
    fn upsert_head(&mut self, record: R) {
        match self.position(record.id()) {
            Some(pos) => self.items[pos] = record,
            None => self.items.insert(0, record),
        }
    }
}

/// Prevents overlapping `fetch_all` calls; released on drop.
struct FetchGuard<'a>(&'a AtomicBool);

impl<'a> FetchGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cached collection of one entity family.
pub struct EntityStore<R: Normalize> {
    family: EntityFamily,
    deps: StoreDeps,
    ledger: Option<Arc<Ledger>>,
    mirrors_from: Vec<EntityFamily>,
    state: RwLock<StoreState<R>>,
    fetching: AtomicBool,
    /// Held from snapshot to save so blobs land in mutation order.
    persisting: Mutex<()>,
}

pub type PostStore = EntityStore<domains::Post>;
pub type CommunityPostStore = EntityStore<domains::Post>;
pub type ShowcaseStore = EntityStore<domains::ShowcaseEntry>;

impl<R: Normalize> EntityStore<R> {
    pub fn new(family: EntityFamily, deps: StoreDeps) -> Self {
        Self {
            family,
            deps,
            ledger: None,
            mirrors_from: Vec::new(),
            state: RwLock::new(StoreState::default()),
            fetching: AtomicBool::new(false),
            persisting: Mutex::new(()),
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Families whose confirmed changes this store copies onto its own records.
    pub fn mirroring(mut self, origins: impl IntoIterator<Item = EntityFamily>) -> Self {
        self.mirrors_from.extend(origins);
        self
    }

    /// Wraps the store and subscribes it to the bus.
    pub async fn shared(self) -> Arc<Self> {
        let store = Arc::new(self);
        store.deps.bus.subscribe(store.clone()).await;
        store
    }

    pub fn family(&self) -> EntityFamily {
        self.family
    }

    pub fn ledger(&self) -> Option<&Arc<Ledger>> {
        self.ledger.as_ref()
    }

    pub(crate) fn deps(&self) -> &StoreDeps {
        &self.deps
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub async fn items(&self) -> Vec<R> {
        self.state.read().await.items.clone()
    }

    pub async fn get(&self, id: &str) -> Option<R> {
        self.state.read().await.find(id).cloned()
    }

    pub async fn page(&self) -> PageMeta {
        self.state.read().await.page.clone()
    }

    pub async fn error(&self) -> Option<String> {
        self.state.read().await.error.clone()
    }

    pub async fn clear_error(&self) {
        self.state.write().await.error = None;
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.items.is_empty()
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::Acquire)
    }

    // ── Fetch ───────────────────────────────────────────────────────────────

    /// Loads one page. `params.reset` replaces the collection, otherwise only
    /// ids not already present are appended.
    ///
    /// On failure the loaded items are kept and `error` is set.
    pub async fn fetch_all(&self, params: PageParams) -> Result<FetchOutcome> {
        let Some(_guard) = FetchGuard::acquire(&self.fetching) else {
            debug!(family = %self.family, "fetch already in flight; skipping");
            return Ok(FetchOutcome::Skipped);
        };

        // Community post lists only exist under a community
        if self.family == EntityFamily::CommunityPost && params.scope.is_none() {
            return self
                .fail(SyncError::Validation("community posts need a community id".into()))
                .await;
        }

        let cx = RequestContext::for_page(params.clone());
        let success = match self.deps.prober.probe(self.family, Operation::Fetch, &cx).await {
            Ok(s) => s,
            Err(e) => return self.fail(e).await,
        };

        let body = success.response.body.unwrap_or(Value::Null);
        let marks = self.ledger_snapshot().await;
        let user = self.deps.current_user_id();
        let ncx = self.normalize_context(user.as_deref(), marks.as_ref());

        let listed = extract_list(&body, R::PLURAL_KEY).len();
        let mut incoming: Vec<R> = normalize_list(&body, &ncx);
        // Lists served under a parent route often omit the parent field
        if let Some(scope) = params.scope.as_deref() {
            incoming.iter_mut().for_each(|r| r.adopt_scope(scope));
        }
        if incoming.len() < listed {
            warn!(
                family = %self.family,
                skipped = listed - incoming.len(),
                "dropped list items that did not normalize"
            );
        }
        let meta = extract_page_meta(&body, &params, listed);
        let received = incoming.len();

        let added = {
            let mut state = self.state.write().await;
            let added = if params.reset {
                let mut seen = BTreeSet::new();
                state.items = incoming
                    .into_iter()
                    .filter(|r| seen.insert(r.id().to_string()))
                    .collect();
                state.items.len()
            } else {
                let mut added = 0;
                for record in incoming {
                    if state.position(record.id()).is_none() {
                        state.items.push(record);
                        added += 1;
                    }
                }
                added
            };
            state.page = meta;
            state.error = None;
            added
        };
        self.persist().await;

        info!(
            family = %self.family,
            page = params.page,
            received,
            added,
            reset = params.reset,
            "page loaded"
        );
        Ok(FetchOutcome::Loaded { received, added })
    }

    // ── Likes ───────────────────────────────────────────────────────────────

    pub async fn like(&self, id: &str) -> Result<LikeState> {
        self.toggle_like(id, true).await
    }

    pub async fn unlike(&self, id: &str) -> Result<LikeState> {
        self.toggle_like(id, false).await
    }

    async fn toggle_like(&self, id: &str, liked: bool) -> Result<LikeState> {
        self.require_session().await?;

        // 1. Optimistic flip, recorded under a fresh generation
        let staged = {
            let mut state = self.state.write().await;
            let flipped = state.find_mut(id).map(|record| {
                let prior = record.core().likes;
                let likes = &mut record.core_mut().likes;
                let changed = if liked { likes.apply_like() } else { likes.apply_unlike() };
                (prior, changed, record.scope().map(str::to_owned))
            });
            flipped.map(|(prior, changed, scope)| {
                changed.then(|| (prior, state.bump_generation(id), scope))
            })
        };
        let (prior, generation, scope) = match staged {
            None => return self.fail(SyncError::not_found(self.family.as_str(), id)).await,
            Some(None) => {
                debug!(family = %self.family, id, liked, "like state already applied");
                return self.like_state_or(id, LikeState::default()).await;
            }
            Some(Some(staged)) => staged,
        };

        // 2. Ledger follows the optimistic state
        let prior_mark = match &self.ledger {
            Some(ledger) => {
                let was = ledger.is_marked(id).await;
                ledger.set_marked(id, liked).await;
                Some(was)
            }
            None => None,
        };
        self.persist().await;

        // 3. Confirm
        let op = if liked { Operation::Like } else { Operation::Unlike };
        let user = self.deps.current_user_id();
        let cx = RequestContext::for_entity(id).with_scope(scope).with_user(user.clone());

        match self.deps.prober.probe(self.family, op, &cx).await {
            Ok(success) => {
                let resolved = success
                    .response
                    .body
                    .as_ref()
                    .map(|b| likes_from_response(b, R::SINGULAR_KEY))
                    .unwrap_or_default();
                let server_lists_user = user.as_deref().is_some_and(|uid| resolved.lists(uid));

                let merged = self
                    .mutate_if_current(id, generation, |record| {
                        let likes = &mut record.core_mut().likes;
                        if let Some(count) = resolved.count {
                            likes.count = count;
                        }
                        // Explicit server membership beats an optimistic unlike
                        if !liked && server_lists_user {
                            likes.liked_by_current_user = true;
                        }
                        *likes
                    })
                    .await;

                let Some(likes) = merged else {
                    self.discard_stale(id, op);
                    return self.like_state_or(id, prior).await;
                };
                if likes.liked_by_current_user != liked {
                    if let Some(ledger) = &self.ledger {
                        ledger.set_marked(id, likes.liked_by_current_user).await;
                    }
                }
                self.persist().await;
                self.deps
                    .bus
                    .publish(MirrorEvent::new(self.family, id, MirrorChange::Likes(likes)))
                    .await;
                Ok(likes)
            }
            Err(e) => {
                let restored = self
                    .mutate_if_current(id, generation, |record| {
                        record.core_mut().likes = prior;
                    })
                    .await;
                if restored.is_some() {
                    if let (Some(ledger), Some(was)) = (&self.ledger, prior_mark) {
                        ledger.set_marked(id, was).await;
                    }
                    self.deps.metrics.record_rollback(self.family.as_str());
                    warn!(family = %self.family, id, %op, error = %e, "like rolled back");
                    self.persist().await;
                } else {
                    self.discard_stale(id, op);
                }
                self.fail(e).await
            }
        }
    }

    /// Applies `f` only while `generation` is still the entity's latest.
    pub(crate) async fn mutate_if_current<T>(
        &self,
        id: &str,
        generation: u64,
        f: impl FnOnce(&mut R) -> T,
    ) -> Option<T> {
        let mut state = self.state.write().await;
        if !state.is_current(id, generation) {
            return None;
        }
        state.find_mut(id).map(f)
    }

    fn discard_stale(&self, id: &str, op: Operation) {
        self.deps.metrics.record_stale(self.family.as_str());
        debug!(family = %self.family, id, %op, "discarding stale response");
    }

    async fn like_state_or(&self, id: &str, fallback: LikeState) -> Result<LikeState> {
        Ok(self
            .state
            .read()
            .await
            .find(id)
            .map(|r| r.core().likes)
            .unwrap_or(fallback))
    }

    // ── Comments ────────────────────────────────────────────────────────────

    /// Shows a pending comment immediately, then swaps in the server's copy.
    pub async fn add_comment(&self, id: &str, text: &str) -> Result<Comment> {
        let text = text.trim();
        if text.is_empty() {
            return self.fail(SyncError::Validation("comment text is empty".into())).await;
        }
        self.require_session().await?;

        let author = self.deps.credentials.identity().map(|i| i.to_author());
        let placeholder = Comment::pending(author, text);
        let temp = placeholder.id.clone();

        let scope = {
            let mut state = self.state.write().await;
            state.find_mut(id).map(|record| {
                let core = record.core_mut();
                core.comments.push(placeholder.clone());
                core.comment_count += 1;
                record.scope().map(str::to_owned)
            })
        };
        let Some(scope) = scope else {
            return self.fail(SyncError::not_found(self.family.as_str(), id)).await;
        };
        self.persist().await;

        let cx = RequestContext::for_entity(id)
            .with_scope(scope)
            .with_body(json!({ "text": text, "content": text }));

        match self.deps.prober.probe(self.family, Operation::AddComment, &cx).await {
            Ok(success) => {
                let user = self.deps.current_user_id();
                let ncx = self.normalize_context(user.as_deref(), None);
                let confirmed = success
                    .response
                    .body
                    .as_ref()
                    .and_then(|b| comment_from_response(b, R::SINGULAR_KEY, &ncx));

                let outcome = self
                    .update_record(id, |record| {
                        let core = record.core_mut();
                        let slot = core.comments.iter().position(|c| c.id == temp);
                        let comment = match (slot, confirmed) {
                            (Some(pos), Some(server)) => {
                                core.comments[pos] = server.clone();
                                server
                            }
                            (Some(pos), None) => core.comments[pos].clone(),
                            (None, server) => server.unwrap_or_else(|| placeholder.clone()),
                        };
                        (comment, core.comment_count)
                    })
                    .await;
                self.persist().await;
                // The record may have been deleted while the request was in flight
                let Some((comment, count)) = outcome else {
                    return Ok(placeholder);
                };
                self.deps
                    .bus
                    .publish(MirrorEvent::new(self.family, id, MirrorChange::CommentCount(count)))
                    .await;
                Ok(comment)
            }
            Err(e) => {
                self.update_record(id, |record| {
                    let core = record.core_mut();
                    if let Some(pos) = core.comments.iter().position(|c| c.id == temp) {
                        core.comments.remove(pos);
                        core.comment_count = core.comment_count.saturating_sub(1);
                    }
                })
                .await;
                self.deps.metrics.record_rollback(self.family.as_str());
                warn!(family = %self.family, id, error = %e, "comment rolled back");
                self.persist().await;
                self.fail(e).await
            }
        }
    }

    /// Removes a comment locally, restoring it at its old position on failure.
    pub async fn delete_comment(&self, id: &str, comment_id: &str) -> Result<()> {
        self.require_session().await?;

        let removed = {
            let mut state = self.state.write().await;
            state.find_mut(id).map(|record| {
                let scope = record.scope().map(str::to_owned);
                let core = record.core_mut();
                core.comments
                    .iter()
                    .position(|c| c.id == comment_id)
                    .map(|pos| {
                        let comment = core.comments.remove(pos);
                        core.comment_count = core.comment_count.saturating_sub(1);
                        (pos, comment, core.comment_count, scope)
                    })
            })
        };
        let (index, comment, count, scope) = match removed {
            None => return self.fail(SyncError::not_found(self.family.as_str(), id)).await,
            Some(None) => return self.fail(SyncError::not_found("comment", comment_id)).await,
            Some(Some(removed)) => removed,
        };
        self.persist().await;

        // A pending comment never reached the server
        if comment.is_pending() {
            return Ok(());
        }

        let cx = RequestContext::for_entity(id).with_scope(scope).with_target(comment_id);
        match self.deps.prober.probe(self.family, Operation::DeleteComment, &cx).await {
            Ok(_) => {
                self.deps
                    .bus
                    .publish(MirrorEvent::new(self.family, id, MirrorChange::CommentCount(count)))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.update_record(id, |record| {
                    let core = record.core_mut();
                    let at = index.min(core.comments.len());
                    core.comments.insert(at, comment);
                    core.comment_count += 1;
                })
                .await;
                self.deps.metrics.record_rollback(self.family.as_str());
                warn!(family = %self.family, id, comment_id, error = %e, "comment delete rolled back");
                self.persist().await;
                self.fail(e).await
            }
        }
    }

    // ── Create / delete ─────────────────────────────────────────────────────

    /// Inserts a temporary record at the head, replaced by the server's record
    /// on success and removed again on failure.
    pub async fn create(&self, draft: Draft) -> Result<R> {
        if draft.content.trim().is_empty() && draft.media.is_empty() && draft.title.is_none() {
            return self.fail(SyncError::Validation("draft is empty".into())).await;
        }
        self.require_session().await?;

        let body = match serde_json::to_value(&draft) {
            Ok(body) => body,
            Err(e) => return self.fail(e.into()).await,
        };
        let temp = temp_id();
        let author = self.deps.credentials.identity().map(|i| i.to_author());
        let optimistic = R::from_draft(temp.clone(), author, &draft, Utc::now());

        self.state.write().await.items.insert(0, optimistic.clone());
        self.persist().await;

        let cx = RequestContext::for_entity(temp.as_str())
            .with_scope(draft.community_id.clone())
            .with_body(body);

        match self.deps.prober.probe(self.family, Operation::Create, &cx).await {
            Ok(success) => {
                let marks = self.ledger_snapshot().await;
                let user = self.deps.current_user_id();
                let ncx = self.normalize_context(user.as_deref(), marks.as_ref());
                let confirmed: Option<R> = success
                    .response
                    .body
                    .as_ref()
                    .and_then(|b| normalize_single(b, &ncx));

                let Some(record) = confirmed else {
                    debug!(family = %self.family, id = %temp, "create confirmed without a record; keeping temporary");
                    return Ok(optimistic);
                };
                {
                    let mut state = self.state.write().await;
                    match state.position(&temp) {
                        Some(pos) if state.position(record.id()).is_none() => {
                            state.items[pos] = record.clone();
                        }
                        Some(pos) => {
                            state.items.remove(pos);
                            state.upsert_head(record.clone());
                        }
                        None => state.upsert_head(record.clone()),
                    }
                }
                self.persist().await;
                info!(family = %self.family, id = %record.id(), "created");
                Ok(record)
            }
            Err(e) => {
                self.remove_from_state(&temp).await;
                self.deps.metrics.record_rollback(self.family.as_str());
                warn!(family = %self.family, error = %e, "create rolled back");
                self.persist().await;
                self.fail(e).await
            }
        }
    }

    /// Removes the record locally and tells the other views right away.
    /// The removal stands even if the backend refuses.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.require_session().await?;

        let removed = {
            let mut state = self.state.write().await;
            let removed = state.position(id).map(|pos| state.items.remove(pos));
            state.generations.remove(id);
            removed
        };
        let Some(record) = removed else {
            return self.fail(SyncError::not_found(self.family.as_str(), id)).await;
        };
        self.persist().await;
        self.deps
            .bus
            .publish(MirrorEvent::new(self.family, id, MirrorChange::Removed))
            .await;

        if is_temp_id(id) {
            return Ok(());
        }

        let cx = RequestContext::for_entity(id).with_scope(record.scope().map(str::to_owned));
        match self.deps.prober.probe(self.family, Operation::Delete, &cx).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(family = %self.family, id, error = %e, "delete not confirmed; keeping local removal");
                self.fail(e).await
            }
        }
    }

    // ── Merge surface ───────────────────────────────────────────────────────

    /// Normalizes an externally received payload and merges it by id.
    pub async fn upsert_payload(&self, payload: &Value) -> Result<R> {
        let marks = self.ledger_snapshot().await;
        let user = self.deps.current_user_id();
        let ncx = self.normalize_context(user.as_deref(), marks.as_ref());
        let Some(record) = normalize_single::<R>(payload, &ncx) else {
            return self
                .fail(SyncError::MalformedResponse(format!("{} payload has no id", self.family)))
                .await;
        };
        self.state.write().await.upsert_head(record.clone());
        self.persist().await;
        Ok(record)
    }

    /// Applies `f` to the record in place.
    pub async fn update(&self, id: &str, f: impl FnOnce(&mut R)) -> Result<R> {
        let updated = self
            .update_record(id, |record| {
                f(record);
                record.clone()
            })
            .await;
        match updated {
            Some(record) => {
                self.persist().await;
                Ok(record)
            }
            None => self.fail(SyncError::not_found(self.family.as_str(), id)).await,
        }
    }

    /// Drops the record without contacting the backend.
    pub async fn remove_local(&self, id: &str) -> bool {
        let removed = self.remove_from_state(id).await;
        if removed {
            self.persist().await;
        }
        removed
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Restores the persisted collection and overlays the ledger.
    pub async fn rehydrate(&self) -> Result<usize> {
        let restored: Option<PersistedCollection<R>> =
            match load_versioned(self.deps.blobs.as_ref(), self.family.storage_key(), STORE_VERSION).await {
                Ok(restored) => restored,
                Err(e) => return self.fail(e).await,
            };
        let marks = self.ledger_snapshot().await;

        let mut state = self.state.write().await;
        let PersistedCollection { items, page } = restored.unwrap_or(PersistedCollection {
            items: Vec::new(),
            page: PageMeta::default(),
        });
        state.items = items;
        state.page = page;
        if let Some(marks) = &marks {
            for record in state.items.iter_mut() {
                if marks.contains(record.id()) {
                    record.core_mut().likes.liked_by_current_user = true;
                }
            }
        }
        debug!(family = %self.family, items = state.items.len(), "store rehydrated");
        Ok(state.items.len())
    }

    /// Empties the store and its persisted blob.
    pub async fn clear(&self) {
        *self.state.write().await = StoreState::default();
        if let Err(e) = self.deps.blobs.remove(self.family.storage_key()).await {
            warn!(family = %self.family, error = %e, "failed to remove persisted store");
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    pub(crate) async fn fail<T>(&self, err: SyncError) -> Result<T> {
        self.state.write().await.error = Some(err.to_string());
        Err(err)
    }

    pub(crate) async fn require_session(&self) -> Result<()> {
        if self.deps.has_session() {
            Ok(())
        } else {
            self.fail(SyncError::NotAuthenticated).await
        }
    }

    pub(crate) async fn update_record<T>(&self, id: &str, f: impl FnOnce(&mut R) -> T) -> Option<T> {
        self.state.write().await.find_mut(id).map(f)
    }

    async fn remove_from_state(&self, id: &str) -> bool {
        let mut state = self.state.write().await;
        match state.position(id) {
            Some(pos) => {
                state.items.remove(pos);
                true
            }
            None => false,
        }
    }

    async fn ledger_snapshot(&self) -> Option<BTreeSet<String>> {
        match &self.ledger {
            Some(ledger) => Some(ledger.snapshot().await),
            None => None,
        }
    }

    fn normalize_context<'a>(
        &self,
        user: Option<&'a str>,
        marks: Option<&'a BTreeSet<String>>,
    ) -> NormalizeContext<'a> {
        NormalizeContext::new(user, marks).with_max_depth(self.deps.max_comment_depth)
    }

    pub(crate) async fn persist(&self) {
        let _order = self.persisting.lock().await;
        let snapshot = {
            let state = self.state.read().await;
            PersistedCollection { items: state.items.clone(), page: state.page.clone() }
        };
        if let Err(e) =
            save_versioned(self.deps.blobs.as_ref(), self.family.storage_key(), STORE_VERSION, &snapshot).await
        {
            warn!(family = %self.family, error = %e, "failed to persist store; keeping in-memory state");
        }
    }
}

#[async_trait]
impl<R: Normalize> Mirror for EntityStore<R> {
    fn family(&self) -> EntityFamily {
        self.family
    }

    fn accepts(&self, origin: EntityFamily) -> bool {
        self.mirrors_from.contains(&origin)
    }

    async fn mirror(&self, event: &MirrorEvent) -> bool {
        let changed = {
            let mut state = self.state.write().await;
            match &event.change {
                MirrorChange::Removed => match state.position(&event.entity_id) {
                    Some(pos) => {
                        state.items.remove(pos);
                        true
                    }
                    None => false,
                },
                MirrorChange::Likes(likes) => {
                    let changed = match state.find_mut(&event.entity_id) {
                        Some(record) if record.core().likes != *likes => {
                            record.core_mut().likes = *likes;
                            true
                        }
                        _ => false,
                    };
                    // A confirmed sibling like outranks any local toggle still in flight
                    if state.position(&event.entity_id).is_some() {
                        state.bump_generation(&event.entity_id);
                    }
                    changed
                }
                MirrorChange::CommentCount(count) => match state.find_mut(&event.entity_id) {
                    Some(record) if record.core().comment_count != *count => {
                        record.core_mut().comment_count = *count;
                        true
                    }
                    _ => false,
                },
            }
        };
        if changed {
            self.persist().await;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deps_with, page_body, post_json, session};
    use domains::{ApiResponse, MockRemoteTransport, Post};
    use mockall::Sequence;
    use serde_json::json;
    use storage_adapters::MemoryBlobStore;

    async fn seeded(transport: MockRemoteTransport) -> (Arc<PostStore>, Arc<Ledger>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let deps = deps_with(transport, blobs.clone(), session());
        let ledger = Arc::new(Ledger::new(crate::ledger::POST_LEDGER_KEY, blobs));
        let store = Arc::new(PostStore::new(EntityFamily::Post, deps).with_ledger(ledger.clone()));
        store
            .upsert_payload(&post_json("post-7", 5, &[]))
            .await
            .unwrap();
        (store, ledger)
    }

    #[tokio::test]
    async fn test_like_confirms_server_count() {
        let mut transport = MockRemoteTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(ApiResponse::json(200, json!({ "likes": 6 }))));
        let (store, ledger) = seeded(transport).await;

        let likes = store.like("post-7").await.unwrap();
        assert_eq!(likes, LikeState::new(6, true));
        assert!(ledger.is_marked("post-7").await);
        assert_eq!(store.error().await, None);
    }

    #[tokio::test]
    async fn test_like_is_idempotent() {
        let mut transport = MockRemoteTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(ApiResponse::empty(204)));
        let (store, _) = seeded(transport).await;

        store.like("post-7").await.unwrap();
        let again = store.like("post-7").await.unwrap();
        assert_eq!(again, LikeState::new(6, true));
    }

    #[tokio::test]
    async fn test_like_failure_rolls_back() {
        let mut transport = MockRemoteTransport::new();
        transport
            .expect_send()
            .returning(|_| Err(anyhow::anyhow!("offline")));
        let (store, ledger) = seeded(transport).await;

        let err = store.like("post-7").await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        let post: Post = store.get("post-7").await.unwrap();
        assert_eq!(post.core.likes, LikeState::new(5, false));
        assert!(!ledger.is_marked("post-7").await);
        assert!(store.error().await.is_some());
        assert_eq!(store.deps().metrics.rollback_count("post"), 1);
    }

    #[tokio::test]
    async fn test_unlike_keeps_explicit_server_membership() {
        let mut transport = MockRemoteTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApiResponse::empty(200)));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApiResponse::json(200, json!({ "likes": ["user-1", "other"] }))));
        let (store, ledger) = seeded(transport).await;

        store.like("post-7").await.unwrap();
        let likes = store.unlike("post-7").await.unwrap();
        assert_eq!(likes, LikeState::new(2, true));
        assert!(ledger.is_marked("post-7").await);
    }

    #[tokio::test]
    async fn test_like_requires_session() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let mut creds = domains::MockCredentials::new();
        creds.expect_token().returning(|| None);
        creds.expect_identity().returning(|| None);
        let deps = deps_with(MockRemoteTransport::new(), blobs, Arc::new(creds));
        let store = PostStore::new(EntityFamily::Post, deps);

        let err = store.like("post-7").await.unwrap_err();
        assert_eq!(err, SyncError::NotAuthenticated);
        assert!(store.error().await.is_some());
    }

    #[tokio::test]
    async fn test_fetch_reset_and_append() {
        let mut transport = MockRemoteTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApiResponse::json(200, page_body(&["a", "b"], 1, true))));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApiResponse::json(200, page_body(&["b", "c"], 2, false))));
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = PostStore::new(EntityFamily::Post, deps_with(transport, blobs, session()));

        let first = store.fetch_all(PageParams::first(2)).await.unwrap();
        assert_eq!(first, FetchOutcome::Loaded { received: 2, added: 2 });

        let next = PageParams::next(&store.page().await, 2);
        let second = store.fetch_all(next).await.unwrap();
        assert_eq!(second, FetchOutcome::Loaded { received: 2, added: 1 });

        let ids: Vec<String> = store.items().await.iter().map(|p| p.core.id.clone()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(!store.page().await.has_next);
    }

    #[tokio::test]
    async fn test_fetch_failure_preserves_items() {
        let mut transport = MockRemoteTransport::new();
        transport
            .expect_send()
            .returning(|_| Ok(ApiResponse::json(500, json!({ "message": "db down" }))));
        let (store, _) = seeded(transport).await;

        let err = store.fetch_all(PageParams::first(20)).await.unwrap_err();
        assert!(matches!(err, SyncError::Http { status: 500, .. }));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.error().await.as_deref(), Some("server returned 500: db down"));
    }

    #[tokio::test]
    async fn test_comment_placeholder_swapped_for_server_copy() {
        let mut transport = MockRemoteTransport::new();
        transport.expect_send().times(1).returning(|_| {
            Ok(ApiResponse::json(201, json!({ "comment": { "_id": "c-1", "text": "nice" } })))
        });
        let (store, _) = seeded(transport).await;

        let comment = store.add_comment("post-7", "  nice ").await.unwrap();
        assert_eq!(comment.id, "c-1");
        let post = store.get("post-7").await.unwrap();
        assert_eq!(post.core.comment_count, 1);
        assert_eq!(post.core.comments[0].id, "c-1");
    }

    #[tokio::test]
    async fn test_comment_failure_removes_placeholder() {
        let mut transport = MockRemoteTransport::new();
        transport.expect_send().returning(|_| Ok(ApiResponse::empty(404)));
        let (store, _) = seeded(transport).await;

        let err = store.add_comment("post-7", "hello").await.unwrap_err();
        assert!(err.is_endpoint_not_found());
        let post = store.get("post-7").await.unwrap();
        assert_eq!(post.core.comment_count, 0);
        assert!(post.core.comments.is_empty());
    }

    #[tokio::test]
    async fn test_blank_comment_rejected_before_mutation() {
        let (store, _) = seeded(MockRemoteTransport::new()).await;
        let err = store.add_comment("post-7", "   ").await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(store.get("post-7").await.unwrap().core.comment_count, 0);
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_failure() {
        let mut transport = MockRemoteTransport::new();
        transport
            .expect_send()
            .returning(|_| Ok(ApiResponse::json(422, json!({ "error": "too long" }))));
        let (store, _) = seeded(transport).await;

        let err = store.create(Draft::new("hello")).await.unwrap_err();
        assert_eq!(err, SyncError::Http { status: 422, message: "too long".into() });
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_create_replaces_temporary_record() {
        let mut transport = MockRemoteTransport::new();
        transport
            .expect_send()
            .returning(|_| Ok(ApiResponse::json(201, json!({ "post": post_json("post-42", 0, &[]) }))));
        let (store, _) = seeded(transport).await;

        let created = store.create(Draft::new("hello")).await.unwrap();
        assert_eq!(created.core.id, "post-42");
        let items = store.items().await;
        assert_eq!(items[0].core.id, "post-42");
        assert!(items.iter().all(|p| !is_temp_id(&p.core.id)));
    }

    #[tokio::test]
    async fn test_delete_is_client_wins() {
        let mut transport = MockRemoteTransport::new();
        transport.expect_send().returning(|_| Err(anyhow::anyhow!("offline")));
        let (store, _) = seeded(transport).await;

        assert!(store.delete("post-7").await.is_err());
        assert!(store.get("post-7").await.is_none());
        assert!(store.error().await.is_some());
    }

    #[tokio::test]
    async fn test_rehydrate_overlays_ledger() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let ledger = Arc::new(Ledger::new(crate::ledger::POST_LEDGER_KEY, blobs.clone()));
        {
            let deps = deps_with(MockRemoteTransport::new(), blobs.clone(), session());
            let store = PostStore::new(EntityFamily::Post, deps);
            store.upsert_payload(&post_json("post-3", 1, &[])).await.unwrap();
        }
        ledger.set_marked("post-3", true).await;

        let deps = deps_with(MockRemoteTransport::new(), blobs, session());
        let store = PostStore::new(EntityFamily::Post, deps).with_ledger(ledger);
        assert_eq!(store.rehydrate().await.unwrap(), 1);
        assert!(store.get("post-3").await.unwrap().core.likes.liked_by_current_user);
    }

    #[tokio::test]
    async fn test_stale_like_response_is_discarded() {
        let (store, _) = seeded(MockRemoteTransport::new()).await;

        // Simulate a toggle issued after generation 1
        let generation = {
            let mut state = store.state.write().await;
            state.bump_generation("post-7");
            state.bump_generation("post-7")
        };
        assert!(store.mutate_if_current("post-7", generation - 1, |_| ()).await.is_none());
        assert!(store.mutate_if_current("post-7", generation, |_| ()).await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_fetch_is_skipped() {
        let store = PostStore::new(
            EntityFamily::Post,
            deps_with(MockRemoteTransport::new(), Arc::new(MemoryBlobStore::new()), session()),
        );
        let _held = FetchGuard::acquire(&store.fetching).unwrap();
        let outcome = store.fetch_all(PageParams::first(10)).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Skipped);
    }

    /// Holds the first save until released; later saves pass straight through.
    struct SlowFirstSave {
        inner: MemoryBlobStore,
        held: AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl BlobStore for SlowFirstSave {
        async fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.load(key).await
        }

        async fn save(&self, key: &str, blob: String) -> anyhow::Result<()> {
            if !self.held.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.save(key, blob).await
        }

        async fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.inner.remove(key).await
        }
    }

    #[tokio::test]
    async fn test_slow_save_cannot_overwrite_a_newer_snapshot() {
        let blobs = Arc::new(SlowFirstSave {
            inner: MemoryBlobStore::new(),
            held: AtomicBool::new(false),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let store = Arc::new(PostStore::new(
            EntityFamily::Post,
            deps_with(MockRemoteTransport::new(), blobs.clone(), session()),
        ));

        let first = {
            let store = store.clone();
            tokio::spawn(async move { store.upsert_payload(&post_json("p1", 0, &[])).await })
        };
        blobs.entered.notified().await;
        let second = {
            let store = store.clone();
            tokio::spawn(async move { store.upsert_payload(&post_json("p2", 0, &[])).await })
        };
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        blobs.release.notify_one();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let restored = PostStore::new(
            EntityFamily::Post,
            deps_with(MockRemoteTransport::new(), blobs.clone(), session()),
        );
        assert_eq!(restored.rehydrate().await.unwrap(), 2);
        let ids: Vec<String> = restored.items().await.iter().map(|p| p.core.id.clone()).collect();
        assert_eq!(ids, ["p2", "p1"]);
    }
}
