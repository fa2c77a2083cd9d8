//! # Sync Bus
//!
//! The same logical post can be visible in the home feed and in a
//! community's post list. After a confirmed mutation the owning store
//! publishes a [`MirrorEvent`]; every other subscribed store that accepts the
//! origin family patches its own copy, or does nothing when it holds none.
//!
//! Subscribers are held weakly so a dropped store simply stops receiving.
//! Mirroring is local only: it never publishes again and never hits the network.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use domains::{EntityFamily, LikeState};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorChange {
    Likes(LikeState),
    CommentCount(u64),
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorEvent {
    pub origin: EntityFamily,
    pub entity_id: String,
    pub change: MirrorChange,
}

impl MirrorEvent {
    pub fn new(origin: EntityFamily, entity_id: impl Into<String>, change: MirrorChange) -> Self {
        Self { origin, entity_id: entity_id.into(), change }
    }
}

/// A store that can apply another store's confirmed changes to its own copy.
#[async_trait]
pub trait Mirror: Send + Sync {
    /// The subscriber's own family. Events it published itself are skipped.
    fn family(&self) -> EntityFamily;

    /// Whether events from `origin` concern this store at all.
    fn accepts(&self, origin: EntityFamily) -> bool;

    /// Applies `event`; returns whether a local record changed.
    async fn mirror(&self, event: &MirrorEvent) -> bool;
}

#[derive(Default)]
pub struct SyncBus {
    subscribers: RwLock<Vec<Weak<dyn Mirror>>>,
}

impl SyncBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, mirror: Arc<dyn Mirror>) {
        self.subscribers.write().await.push(Arc::downgrade(&mirror));
    }

    /// Delivers `event` to every live subscriber other than the origin.
    /// Returns how many applied it. Never fails.
    pub async fn publish(&self, event: MirrorEvent) -> usize {
        let live: Vec<Arc<dyn Mirror>> = {
            let mut subscribers = self.subscribers.write().await;
            subscribers.retain(|w| w.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };

        let mut applied = 0;
        for mirror in live {
            if mirror.family() == event.origin || !mirror.accepts(event.origin) {
                continue;
            }
            if mirror.mirror(&event).await {
                applied += 1;
            }
        }
        debug!(origin = %event.origin, id = %event.entity_id, applied, "mirror event published");
        applied
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .await
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}
