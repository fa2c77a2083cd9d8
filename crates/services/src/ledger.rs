//! # Like Ledger
//!
//! A durable presence-set of "the current user liked X" facts, kept apart
//! from the entity stores. The backend's like counts and likers lists have
//! disagreed across endpoints, so after a reload the ledger decides: a marked
//! id is shown as liked no matter what the fresh payload says.
//!
//! Absence means "not liked or unknown". `set_marked(id, false)` removes the
//! key; the ledger never stores explicit negatives.

use std::collections::BTreeSet;
use std::sync::Arc;

use domains::{BlobStore, Result};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::persist::{load_versioned, save_versioned};

/// Shared by the home feed and community post stores.
pub const POST_LEDGER_KEY: &str = "post-like-ledger";
pub const SHOWCASE_LEDGER_KEY: &str = "showcase-like-ledger";

const LEDGER_VERSION: u32 = 1;

pub struct Ledger {
    key: String,
    marks: RwLock<BTreeSet<String>>,
    blobs: Arc<dyn BlobStore>,
}

impl Ledger {
    pub fn new(key: impl Into<String>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { key: key.into(), marks: RwLock::new(BTreeSet::new()), blobs }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Restores the persisted set. Must run before any store rehydrates so
    /// overlays apply from the first read.
    pub async fn rehydrate(&self) -> Result<usize> {
        let restored: Option<BTreeSet<String>> =
            load_versioned(self.blobs.as_ref(), &self.key, LEDGER_VERSION).await?;
        let mut marks = self.marks.write().await;
        *marks = restored.unwrap_or_default();
        debug!(key = %self.key, marked = marks.len(), "ledger rehydrated");
        Ok(marks.len())
    }

    pub async fn is_marked(&self, id: &str) -> bool {
        self.marks.read().await.contains(id)
    }

    pub async fn snapshot(&self) -> BTreeSet<String> {
        self.marks.read().await.clone()
    }

    /// Marks or unmarks `id`. Returns whether the set changed.
    pub async fn set_marked(&self, id: &str, marked: bool) -> bool {
        let mut marks = self.marks.write().await;
        let changed = if marked {
            marks.insert(id.to_string())
        } else {
            marks.remove(id)
        };
        if changed {
            self.persist(&marks).await;
        }
        changed
    }

    /// Bulk form of [`Ledger::set_marked`]; persists once.
    pub async fn set_many_marked<I, S>(&self, ids: I, marked: bool) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut marks = self.marks.write().await;
        let changed = ids
            .into_iter()
            .filter(|id| {
                if marked {
                    marks.insert(id.as_ref().to_string())
                } else {
                    marks.remove(id.as_ref())
                }
            })
            .count();
        if changed > 0 {
            self.persist(&marks).await;
        }
        changed
    }

    pub async fn clear(&self) {
        let mut marks = self.marks.write().await;
        marks.clear();
        if let Err(e) = self.blobs.remove(&self.key).await {
            warn!(key = %self.key, error = %e, "failed to remove persisted ledger");
        }
    }

    // The write guard is held across the save so blobs land in mutation order.
    async fn persist(&self, marks: &BTreeSet<String>) {
        if let Err(e) = save_versioned(self.blobs.as_ref(), &self.key, LEDGER_VERSION, marks).await {
            warn!(key = %self.key, error = %e, "failed to persist ledger; keeping in-memory state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_adapters::MemoryBlobStore;

    fn ledger(blobs: &Arc<MemoryBlobStore>) -> Ledger {
        Ledger::new(POST_LEDGER_KEY, blobs.clone())
    }

    #[tokio::test]
    async fn test_absence_means_unmarked() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let l = ledger(&blobs);
        assert!(!l.is_marked("post-1").await);

        assert!(l.set_marked("post-1", true).await);
        assert!(l.is_marked("post-1").await);

        // Unmarking removes the key instead of storing a negative
        assert!(l.set_marked("post-1", false).await);
        assert!(l.snapshot().await.is_empty());
        assert!(!l.set_marked("post-1", false).await);
    }

    #[tokio::test]
    async fn test_survives_restart() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let first = ledger(&blobs);
        first.set_many_marked(["a", "b", "c"], true).await;
        first.set_marked("b", false).await;

        let second = ledger(&blobs);
        assert_eq!(second.rehydrate().await.unwrap(), 2);
        assert!(second.is_marked("a").await);
        assert!(!second.is_marked("b").await);
    }

    #[tokio::test]
    async fn test_set_many_counts_changes() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let l = ledger(&blobs);
        assert_eq!(l.set_many_marked(vec!["a".to_string(), "b".to_string()], true).await, 2);
        assert_eq!(l.set_many_marked(["a", "z"], true).await, 1);
        assert_eq!(l.set_many_marked(["a", "b", "q"], false).await, 2);
        assert_eq!(l.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_removes_blob() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let l = ledger(&blobs);
        l.set_marked("a", true).await;
        l.clear().await;
        assert!(blobs.load(POST_LEDGER_KEY).await.unwrap().is_none());
        assert!(!l.is_marked("a").await);
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory() {
        let mut blobs = domains::MockBlobStore::new();
        blobs
            .expect_save()
            .returning(|_, _| Err(anyhow::anyhow!("quota exceeded")));
        let l = Ledger::new("k", Arc::new(blobs));
        assert!(l.set_marked("a", true).await);
        assert!(l.is_marked("a").await);
    }
}
