//! Candidate scheduling for the ping, handshake and crawl stages
//!
//! The eligibility predicates live in [`handshake`] and [`crawl`]; the
//! stores evaluate the same rules either in SQL or over in-memory records.
//! [`CandidateScheduler`] is the driver-facing side: it hands out claimed
//! batches, retrying on storage contention, and records handshake outcomes so
//! the next round sees them.

pub mod crawl;
pub mod handshake;

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

pub use crawl::CrawlCriteria;
pub use handshake::{HandshakeCriteria, HandshakeCutoffs};

use crate::error::Result;
use crate::models::NodeId;
use crate::storage::SharedNodeStore;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// `now - quiet`, clamped to the earliest representable time
pub fn cutoff(now: DateTime<Utc>, quiet: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(quiet)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Result of one handshake attempt as reported by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The node answered and identified itself
    Success { client_id: String },
    /// The attempt failed with the given error tag
    Failure { error: String },
}

/// Hands out disjoint batches of work to concurrent crawl workers
pub struct CandidateScheduler {
    store: SharedNodeStore,
    handshake: HandshakeCriteria,
    crawl: CrawlCriteria,
    retry: RetryConfig,
}

impl CandidateScheduler {
    /// Create a scheduler over a shared store
    pub fn new(store: SharedNodeStore, handshake: HandshakeCriteria, crawl: CrawlCriteria) -> Self {
        Self {
            store,
            handshake,
            crawl,
            retry: RetryConfig::default(),
        }
    }

    /// Set the backoff used when a claim hits lock contention
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Underlying store
    pub fn store(&self) -> &SharedNodeStore {
        &self.store
    }

    /// Claim the next batch of handshake candidates
    pub async fn next_handshake_batch(&self) -> Result<Vec<NodeId>> {
        let ids = with_retry_if(
            &self.retry,
            || self.store.take_handshake_candidates(&self.handshake),
            |e| self.store.is_conflict_error(e),
        )
        .await?;

        debug!(count = ids.len(), limit = self.handshake.limit, "Claimed handshake batch");
        Ok(ids)
    }

    /// Claim the next batch of crawl candidates
    pub async fn next_crawl_batch(&self) -> Result<Vec<NodeId>> {
        let ids = with_retry_if(
            &self.retry,
            || self.store.take_candidates(&self.crawl),
            |e| self.store.is_conflict_error(e),
        )
        .await?;

        debug!(count = ids.len(), limit = self.crawl.limit, "Claimed crawl batch");
        Ok(ids)
    }

    /// Record a ping result
    pub async fn report_ping(&self, id: &NodeId, ok: bool) -> Result<()> {
        if ok {
            self.store.reset_ping_error(id).await
        } else {
            self.store.update_ping_error(id).await
        }
    }

    /// Record a handshake result, releasing the claim on the node
    pub async fn report_handshake(&self, id: &NodeId, outcome: &HandshakeOutcome) -> Result<()> {
        match outcome {
            HandshakeOutcome::Success { client_id } => {
                self.store.update_client_id(id, client_id).await
            }
            HandshakeOutcome::Failure { error } => {
                self.store.update_handshake_error(id, error).await
            }
        }
    }
}
