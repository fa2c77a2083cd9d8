//! # Follow Store
//!
//! The set of user ids the current user follows. Follow and unfollow behave
//! like likes: optimistic, idempotent, rolled back on failure and guarded by a
//! per-target generation against late responses.

use std::collections::{BTreeSet, HashMap};

use domains::{EntityFamily, Result, SyncError};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::endpoints::{Operation, RequestContext};
use crate::normalize::{extract_list, liker_id};
use crate::persist::{load_versioned, save_versioned};
use crate::stores::entity::StoreDeps;

const FOLLOW_VERSION: u32 = 1;
const FAMILY: EntityFamily = EntityFamily::Follow;

#[derive(Default)]
struct FollowState {
    following: BTreeSet<String>,
    error: Option<String>,
    generations: HashMap<String, u64>,
}

pub struct FollowStore {
    deps: StoreDeps,
    state: RwLock<FollowState>,
    persisting: Mutex<()>,
}

impl FollowStore {
    pub fn new(deps: StoreDeps) -> Self {
        Self { deps, state: RwLock::new(FollowState::default()), persisting: Mutex::new(()) }
    }

    pub async fn is_following(&self, user_id: &str) -> bool {
        self.state.read().await.following.contains(user_id)
    }

    pub async fn following(&self) -> Vec<String> {
        self.state.read().await.following.iter().cloned().collect()
    }

    pub async fn error(&self) -> Option<String> {
        self.state.read().await.error.clone()
    }

    pub async fn clear_error(&self) {
        self.state.write().await.error = None;
    }

    pub async fn follow(&self, user_id: &str) -> Result<bool> {
        self.toggle(user_id, true).await
    }

    pub async fn unfollow(&self, user_id: &str) -> Result<bool> {
        self.toggle(user_id, false).await
    }

    /// Returns whether the current user follows `target` afterwards.
    async fn toggle(&self, target: &str, follow: bool) -> Result<bool> {
        if !self.deps.has_session() {
            return self.fail(SyncError::NotAuthenticated).await;
        }
        if self.deps.current_user_id().as_deref() == Some(target) {
            return self.fail(SyncError::Validation("cannot follow yourself".into())).await;
        }

        let generation = {
            let mut state = self.state.write().await;
            let changed = if follow {
                state.following.insert(target.to_string())
            } else {
                state.following.remove(target)
            };
            if !changed {
                return Ok(follow);
            }
            let generation = state.generations.entry(target.to_string()).or_insert(0);
            *generation += 1;
            *generation
        };
        self.persist().await;

        let op = if follow { Operation::Follow } else { Operation::Unfollow };
        let cx = RequestContext::for_entity(target).with_user(self.deps.current_user_id());
        match self.deps.prober.probe(FAMILY, op, &cx).await {
            Ok(_) => {
                info!(target, follow, "follow state confirmed");
                Ok(follow)
            }
            Err(e) => {
                let rolled_back = {
                    let mut state = self.state.write().await;
                    let current = state.generations.get(target) == Some(&generation);
                    if current {
                        if follow {
                            state.following.remove(target);
                        } else {
                            state.following.insert(target.to_string());
                        }
                    }
                    current
                };
                if rolled_back {
                    self.deps.metrics.record_rollback(FAMILY.as_str());
                    warn!(target, %op, error = %e, "follow change rolled back");
                    self.persist().await;
                } else {
                    self.deps.metrics.record_stale(FAMILY.as_str());
                    debug!(target, %op, "discarding stale response");
                }
                self.fail(e).await
            }
        }
    }

    /// Replaces the local set with the server's list.
    pub async fn fetch_following(&self) -> Result<usize> {
        let Some(uid) = self.deps.current_user_id() else {
            return self.fail(SyncError::NotAuthenticated).await;
        };
        let cx = RequestContext::for_entity(uid);
        let success = match self.deps.prober.probe(FAMILY, Operation::FetchFollowing, &cx).await {
            Ok(s) => s,
            Err(e) => return self.fail(e).await,
        };
        let body = success.response.body.unwrap_or(Value::Null);
        let following: BTreeSet<String> = extract_list(&body, "following")
            .iter()
            .filter_map(liker_id)
            .collect();

        let count = following.len();
        {
            let mut state = self.state.write().await;
            state.following = following;
            state.error = None;
        }
        self.persist().await;
        debug!(count, "follow list loaded");
        Ok(count)
    }

    pub async fn rehydrate(&self) -> Result<usize> {
        let restored: Option<BTreeSet<String>> =
            match load_versioned(self.deps.blobs.as_ref(), FAMILY.storage_key(), FOLLOW_VERSION).await {
                Ok(restored) => restored,
                Err(e) => return self.fail(e).await,
            };
        let mut state = self.state.write().await;
        state.following = restored.unwrap_or_default();
        Ok(state.following.len())
    }

    pub async fn clear(&self) {
        *self.state.write().await = FollowState::default();
        if let Err(e) = self.deps.blobs.remove(FAMILY.storage_key()).await {
            warn!(error = %e, "failed to remove persisted follow list");
        }
    }

    async fn fail<T>(&self, err: SyncError) -> Result<T> {
        self.state.write().await.error = Some(err.to_string());
        Err(err)
    }

    async fn persist(&self) {
        let _order = self.persisting.lock().await;
        let snapshot = self.state.read().await.following.clone();
        if let Err(e) =
            save_versioned(self.deps.blobs.as_ref(), FAMILY.storage_key(), FOLLOW_VERSION, &snapshot).await
        {
            warn!(error = %e, "failed to persist follow list");
        }
    }
}
