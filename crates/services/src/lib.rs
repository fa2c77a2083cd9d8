//! feed-sync/crates/services/src/lib.rs
//!
//! The reconciliation layer: normalization of backend payloads, the like
//! ledger, endpoint candidate probing, the per-family stores and the bus that
//! keeps duplicate views of the same record in step.

pub mod app;
pub mod bus;
pub mod endpoints;
pub mod ledger;
pub mod metrics;
pub mod normalize;
pub mod persist;
pub mod probe;
pub mod stores;

#[cfg(test)]
mod test_support;

pub use app::{AppStores, StoreOptions};
pub use bus::{Mirror, MirrorChange, MirrorEvent, SyncBus};
pub use endpoints::{Candidate, CandidateTable, Operation, RequestContext};
pub use ledger::Ledger;
pub use metrics::SyncMetrics;
pub use probe::{ProbeSuccess, Prober};
pub use stores::{
    CommunityPostStore, CommunityStore, EntityStore, FetchOutcome, FollowStore, PostStore,
    ShowcaseStore, StoreDeps,
};
