//! # Sync Metrics
//!
//! Prometheus counters for the reconciliation layer. Cloning `SyncMetrics`
//! shares the underlying counters, so every store reports into one registry.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AttemptOutcome {
    Success,
    NotFound,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    pub family: String,
    pub operation: String,
    pub outcome: AttemptOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FamilyLabels {
    pub family: String,
}

#[derive(Clone, Debug, Default)]
pub struct SyncMetrics {
    /// One increment per candidate request sent.
    pub probe_attempts: Family<ProbeLabels, Counter>,
    /// Optimistic mutations undone after a failed confirmation.
    pub rollbacks: Family<FamilyLabels, Counter>,
    /// Responses dropped because a newer mutation superseded them.
    pub stale_discards: Family<FamilyLabels, Counter>,
}

impl SyncMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "feed_sync_probe_attempts",
            "Candidate requests sent, by outcome",
            self.probe_attempts.clone(),
        );
        registry.register(
            "feed_sync_rollbacks",
            "Optimistic mutations rolled back",
            self.rollbacks.clone(),
        );
        registry.register(
            "feed_sync_stale_discards",
            "Responses discarded as stale",
            self.stale_discards.clone(),
        );
    }

    pub(crate) fn record_attempt(&self, family: &str, operation: &str, outcome: AttemptOutcome) {
        self.probe_attempts
            .get_or_create(&ProbeLabels {
                family: family.to_string(),
                operation: operation.to_string(),
                outcome,
            })
            .inc();
    }

    pub(crate) fn record_rollback(&self, family: &str) {
        self.rollbacks
            .get_or_create(&FamilyLabels { family: family.to_string() })
            .inc();
    }

    pub(crate) fn record_stale(&self, family: &str) {
        self.stale_discards
            .get_or_create(&FamilyLabels { family: family.to_string() })
            .inc();
    }

    pub fn rollback_count(&self, family: &str) -> u64 {
        self.rollbacks
            .get_or_create(&FamilyLabels { family: family.to_string() })
            .get()
    }

    pub fn stale_count(&self, family: &str) -> u64 {
        self.stale_discards
            .get_or_create(&FamilyLabels { family: family.to_string() })
            .get()
    }
}

/// Renders the registry in OpenMetrics text format.
pub fn render(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    encode(&mut buffer, registry)?;
    Ok(buffer)
}
