//! # AppStores
//!
//! Builds every store around one transport, one blob store and one session,
//! and wires the mirroring between the two post views. Nothing here is a
//! global: callers own the returned value.

use std::sync::Arc;
use std::time::Duration;

use domains::{BlobStore, Community, Credentials, EntityFamily, RemoteTransport, Result};
use tracing::info;

use crate::bus::SyncBus;
use crate::endpoints::CandidateTable;
use crate::ledger::{Ledger, POST_LEDGER_KEY, SHOWCASE_LEDGER_KEY};
use crate::metrics::SyncMetrics;
use crate::normalize::DEFAULT_MAX_COMMENT_DEPTH;
use crate::probe::{Prober, DEFAULT_MEMO_TTL};
use crate::stores::{
    CommunityPostStore, CommunityStore, EntityStore, FollowStore, PostStore, ShowcaseStore,
    StoreDeps,
};

/// Tunables applied to every store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub memo_ttl: Duration,
    pub max_comment_depth: usize,
    pub candidates: CandidateTable,
    pub metrics: SyncMetrics,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            memo_ttl: DEFAULT_MEMO_TTL,
            max_comment_depth: DEFAULT_MAX_COMMENT_DEPTH,
            candidates: CandidateTable::standard(),
            metrics: SyncMetrics::default(),
        }
    }
}

pub struct AppStores {
    pub posts: Arc<PostStore>,
    pub community_posts: Arc<CommunityPostStore>,
    pub showcases: Arc<ShowcaseStore>,
    pub communities: CommunityStore,
    pub follows: FollowStore,
    pub post_ledger: Arc<Ledger>,
    pub showcase_ledger: Arc<Ledger>,
    pub prober: Arc<Prober>,
    pub bus: Arc<SyncBus>,
}

impl AppStores {
    pub async fn new(
        transport: Arc<dyn RemoteTransport>,
        blobs: Arc<dyn BlobStore>,
        credentials: Arc<dyn Credentials>,
        options: StoreOptions,
    ) -> Self {
        // 1. Shared collaborators
        let prober = Arc::new(
            Prober::new(transport, Arc::new(options.candidates))
                .with_memo_ttl(options.memo_ttl)
                .with_metrics(options.metrics),
        );
        let bus = Arc::new(SyncBus::new());
        let deps = StoreDeps::new(prober.clone(), blobs.clone(), credentials, bus.clone())
            .with_max_comment_depth(options.max_comment_depth);

        // 2. Ledgers; the two post views share one
        let post_ledger = Arc::new(Ledger::new(POST_LEDGER_KEY, blobs.clone()));
        let showcase_ledger = Arc::new(Ledger::new(SHOWCASE_LEDGER_KEY, blobs));

        // 3. Stores, mirrored where the same record shows up twice
        let posts = PostStore::new(EntityFamily::Post, deps.clone())
            .with_ledger(post_ledger.clone())
            .mirroring([EntityFamily::CommunityPost])
            .shared()
            .await;
        let community_posts = CommunityPostStore::new(EntityFamily::CommunityPost, deps.clone())
            .with_ledger(post_ledger.clone())
            .mirroring([EntityFamily::Post])
            .shared()
            .await;
        let showcases = Arc::new(
            ShowcaseStore::new(EntityFamily::Showcase, deps.clone()).with_ledger(showcase_ledger.clone()),
        );
        let communities = CommunityStore::new(Arc::new(EntityStore::<Community>::new(
            EntityFamily::Community,
            deps.clone(),
        )));
        let follows = FollowStore::new(deps);

        Self {
            posts,
            community_posts,
            showcases,
            communities,
            follows,
            post_ledger,
            showcase_ledger,
            prober,
            bus,
        }
    }

    pub fn metrics(&self) -> &SyncMetrics {
        self.prober.metrics()
    }

    /// Restores persisted state. Ledgers load first so every store overlays
    /// them from its first read.
    pub async fn rehydrate(&self) -> Result<()> {
        let post_marks = self.post_ledger.rehydrate().await?;
        let showcase_marks = self.showcase_ledger.rehydrate().await?;

        let posts = self.posts.rehydrate().await?;
        let community_posts = self.community_posts.rehydrate().await?;
        let showcases = self.showcases.rehydrate().await?;
        let communities = self.communities.rehydrate().await?;
        let following = self.follows.rehydrate().await?;

        info!(
            post_marks,
            showcase_marks,
            posts,
            community_posts,
            showcases,
            communities,
            following,
            "stores rehydrated"
        );
        Ok(())
    }

    /// Drops every cached record, ledger and memoized endpoint.
    pub async fn logout(&self) {
        self.posts.clear().await;
        self.community_posts.clear().await;
        self.showcases.clear().await;
        self.communities.clear().await;
        self.follows.clear().await;
        self.post_ledger.clear().await;
        self.showcase_ledger.clear().await;
        self.prober.forget_all();
        info!("session state cleared");
    }
}
