//! # Candidate Prober
//!
//! Walks the candidate list for a `(family, operation)` pair until one
//! request succeeds. A 404 means "wrong address, try the next one"; any other
//! failure is remembered and also moves on. Once a candidate wins it is
//! memoized for a while so steady-state traffic costs one request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use domains::{ApiResponse, EntityFamily, RemoteTransport, Result, SyncError};
use tracing::debug;

use crate::endpoints::{Candidate, CandidateTable, Operation, RequestContext};
use crate::metrics::{AttemptOutcome, SyncMetrics};
use crate::normalize::envelope_failure;

pub const DEFAULT_MEMO_TTL: Duration = Duration::from_secs(300);

/// The response of the candidate that answered.
#[derive(Debug, Clone)]
pub struct ProbeSuccess {
    pub candidate: &'static str,
    pub response: ApiResponse,
    /// Requests sent, including the winning one.
    pub attempts: usize,
}

pub struct Prober {
    transport: Arc<dyn RemoteTransport>,
    table: Arc<CandidateTable>,
    memo: DashMap<(EntityFamily, Operation), (&'static str, Instant)>,
    memo_ttl: Duration,
    metrics: SyncMetrics,
}

impl Prober {
    pub fn new(transport: Arc<dyn RemoteTransport>, table: Arc<CandidateTable>) -> Self {
        Self {
            transport,
            table,
            memo: DashMap::new(),
            memo_ttl: DEFAULT_MEMO_TTL,
            metrics: SyncMetrics::default(),
        }
    }

    /// A zero TTL disables memoization.
    pub fn with_memo_ttl(mut self, ttl: Duration) -> Self {
        self.memo_ttl = ttl;
        self
    }

    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Name of the memoized winner, if it has not expired.
    pub fn remembered(&self, family: EntityFamily, op: Operation) -> Option<&'static str> {
        let entry = self.memo.get(&(family, op))?;
        let (name, at) = *entry;
        (at.elapsed() < self.memo_ttl).then_some(name)
    }

    pub fn forget_all(&self) {
        self.memo.clear();
    }

    /// Sends candidates in order until one succeeds.
    ///
    /// # Errors
    /// - `NoCandidates` when nothing is configured for the pair.
    /// - `EndpointNotFound` when every candidate answered 404.
    /// - Otherwise the last non-404 failure seen.
    pub async fn probe(
        &self,
        family: EntityFamily,
        op: Operation,
        cx: &RequestContext,
    ) -> Result<ProbeSuccess> {
        let candidates = self.table.candidates(family, op);
        if candidates.is_empty() {
            return Err(SyncError::NoCandidates(format!("{family} {op}")));
        }

        let remembered = self.remembered(family, op);
        let ordered = order_candidates(candidates, remembered);

        let mut last_error: Option<SyncError> = None;
        for (attempt, candidate) in ordered.iter().enumerate() {
            let request = (candidate.build)(cx);
            debug!(%family, %op, candidate = candidate.name, %request, "probing candidate");

            let failure = match self.transport.send(&request).await {
                Err(e) => SyncError::Transport(e.to_string()),
                Ok(response) if response.is_success() => {
                    match response.body.as_ref().and_then(envelope_failure) {
                        Some(message) => SyncError::Rejected(message),
                        None => {
                            self.record(family, op, AttemptOutcome::Success);
                            if !self.memo_ttl.is_zero() {
                                self.memo.insert((family, op), (candidate.name, Instant::now()));
                            }
                            return Ok(ProbeSuccess {
                                candidate: candidate.name,
                                response,
                                attempts: attempt + 1,
                            });
                        }
                    }
                }
                Ok(response) if response.is_not_found() => {
                    self.record(family, op, AttemptOutcome::NotFound);
                    self.forget_if(family, op, remembered, candidate.name);
                    continue;
                }
                Ok(response) => SyncError::Http {
                    status: response.status,
                    message: response.message().unwrap_or("request failed").to_string(),
                },
            };

            debug!(%family, %op, candidate = candidate.name, error = %failure, "candidate failed");
            self.record(family, op, AttemptOutcome::Failed);
            self.forget_if(family, op, remembered, candidate.name);
            last_error = Some(failure);
        }

        Err(last_error.unwrap_or_else(|| SyncError::EndpointNotFound {
            operation: format!("{family} {op}"),
        }))
    }

    fn record(&self, family: EntityFamily, op: Operation, outcome: AttemptOutcome) {
        self.metrics
            .record_attempt(family.as_str(), &op.to_string(), outcome);
    }

    fn forget_if(
        &self,
        family: EntityFamily,
        op: Operation,
        remembered: Option<&'static str>,
        failed: &'static str,
    ) {
        if remembered == Some(failed) {
            self.memo.remove(&(family, op));
        }
    }
}

/// Table order, with the remembered winner moved to the front.
fn order_candidates(candidates: &[Candidate], remembered: Option<&'static str>) -> Vec<Candidate> {
    let mut ordered = candidates.to_vec();
    if let Some(pos) = remembered.and_then(|name| ordered.iter().position(|c| c.name == name)) {
        let winner = ordered.remove(pos);
        ordered.insert(0, winner);
    }
    ordered
}
