//! Crawl candidate selection
//!
//! Crawl eligibility is keyed on `taken_last` and additionally requires the
//! node to be ping-healthy and handshake-healthy. A node that was never
//! pinged has `ping_try == 0` and always passes the ping check.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::cutoff;
use crate::models::NodeRecord;

/// Filters for one round of crawl candidate selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlCriteria {
    /// Cooldown between two crawl claims of the same node
    pub min_unused: Duration,

    /// Ping failure ceiling
    pub max_ping_tries: u32,

    /// Retry ceiling for non-transient handshake errors
    pub max_handshake_tries: u32,

    /// Handshake error tag exempt from the retry ceiling
    pub transient_handshake_err: String,

    /// Maximum number of ids to return
    pub limit: usize,
}

impl CrawlCriteria {
    /// Latest `taken_last` that still allows a new claim
    pub fn taken_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        cutoff(now, self.min_unused)
    }

    /// Check whether a record qualifies for a crawl
    pub fn matches(&self, record: &NodeRecord, taken_before: DateTime<Utc>) -> bool {
        record.taken_last.map_or(true, |taken| taken < taken_before)
            && record.fork_compat.is_eligible()
            && record.ping_try <= self.max_ping_tries
            && (record.handshake_try <= self.max_handshake_tries
                || record.handshake_err.as_deref()
                    == Some(self.transient_handshake_err.as_str()))
    }
}

/// Candidate order: never taken first, then least recently taken, then by id
pub fn priority(a: &NodeRecord, b: &NodeRecord) -> Ordering {
    a.taken_last
        .cmp(&b.taken_last)
        .then_with(|| a.id.cmp(&b.id))
}
