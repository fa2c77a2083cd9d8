//! # feed-sync
//!
//! Boots the client cache against a live backend: restores persisted state,
//! pulls the first page of every feed, logs a summary and prints the sync
//! metrics in OpenMetrics text.

use std::sync::Arc;

use anyhow::Context;
use api_adapters::{HttpTransport, HttpTransportConfig, StaticCredentials};
use configs::{LogSettings, Settings};
use domains::{BlobStore, Credentials, PageParams};
use prometheus_client::registry::Registry;
use services::metrics::render;
use services::{AppStores, CandidateTable, StoreOptions, SyncMetrics};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Settings (.env first) and logging
    let mut settings = Settings::load().context("loading settings")?;
    init_tracing(&settings.log);

    // 2. Session and adapters
    let session = std::mem::take(&mut settings.session);
    let credentials: Arc<dyn Credentials> =
        Arc::new(StaticCredentials::from_parts(session.token, session.user_id, session.name));
    if credentials.token().is_none() {
        warn!("no session configured; authenticated operations will fail");
    }

    let transport = HttpTransport::new(
        HttpTransportConfig {
            base_url: settings.api.base_url.clone(),
            auth_header: settings.api.auth_header.clone(),
            timeout: settings.request_timeout(),
        },
        credentials.clone(),
    )?;
    let blobs = open_blob_store(&settings).await?;

    // 3. Stores
    let metrics = SyncMetrics::default();
    let mut registry = Registry::default();
    metrics.register(&mut registry);

    let stores = AppStores::new(
        Arc::new(transport),
        blobs,
        credentials.clone(),
        StoreOptions {
            memo_ttl: settings.memo_ttl(),
            max_comment_depth: settings.normalize.max_comment_depth,
            candidates: CandidateTable::standard(),
            metrics,
        },
    )
    .await;

    // 4. Restore, then refresh the first page of each feed
    stores.rehydrate().await.context("rehydrating stores")?;

    let first = PageParams::first(settings.feed.page_size);
    if let Err(e) = stores.posts.fetch_all(first.clone()).await {
        warn!(error = %e, "home feed sync failed");
    }
    if let Err(e) = stores.showcases.fetch_all(first.clone()).await {
        warn!(error = %e, "showcase sync failed");
    }
    if let Err(e) = stores.communities.fetch_all(first).await {
        warn!(error = %e, "community sync failed");
    }
    if credentials.identity().is_some() {
        if let Err(e) = stores.follows.fetch_following().await {
            warn!(error = %e, "follow list sync failed");
        }
    }

    info!(
        posts = stores.posts.len().await,
        showcases = stores.showcases.len().await,
        communities = stores.communities.entities().len().await,
        following = stores.follows.following().await.len(),
        liked_posts = stores.post_ledger.snapshot().await.len(),
        "sync complete"
    );

    // 5. Metrics
    println!("{}", render(&registry)?);
    Ok(())
}

fn init_tracing(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "feed_sync={0},services={0},api_adapters={0},storage_adapters={0},warn",
            log.level
        ))
    });
    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[cfg(feature = "file-store")]
async fn open_blob_store(settings: &Settings) -> anyhow::Result<Arc<dyn BlobStore>> {
    let store = storage_adapters::FileBlobStore::open(&settings.storage.data_dir)
        .await
        .with_context(|| format!("opening data dir {}", settings.storage.data_dir))?;
    info!(dir = %store.root().display(), "using file blob store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "file-store"))]
async fn open_blob_store(_settings: &Settings) -> anyhow::Result<Arc<dyn BlobStore>> {
    info!("using in-memory blob store; state is lost on exit");
    Ok(Arc::new(storage_adapters::MemoryBlobStore::new()))
}
