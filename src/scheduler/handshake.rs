//! Handshake candidate selection
//!
//! A node is a handshake candidate when it is quiet long enough, is not on
//! an incompatible fork, and has not exhausted its handshake retries.
//! Successful handshakes get the longer `min_unused_ok` quiet period; failed
//! ones come back after `min_unused_err`. A claimed node counts as a recent
//! failure until its worker reports an outcome.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::cutoff;
use crate::models::NodeRecord;

/// Filters for one round of handshake candidate selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeCriteria {
    /// Quiet period after a successful handshake
    pub min_unused_ok: Duration,

    /// Quiet period after a failed or claimed handshake
    pub min_unused_err: Duration,

    /// Retry ceiling for non-transient errors
    pub max_tries: u32,

    /// Error tag exempt from the retry ceiling
    pub transient_err: String,

    /// Maximum number of ids to return
    pub limit: usize,
}

impl HandshakeCriteria {
    /// Resolve the quiet periods against the current time
    pub fn cutoffs(&self, now: DateTime<Utc>) -> HandshakeCutoffs {
        HandshakeCutoffs {
            ok_before: cutoff(now, self.min_unused_ok),
            err_before: cutoff(now, self.min_unused_err),
        }
    }

    /// Check whether a record qualifies for a handshake attempt
    pub fn matches(&self, record: &NodeRecord, cutoffs: &HandshakeCutoffs) -> bool {
        self.is_quiet(record, cutoffs)
            && record.fork_compat.is_eligible()
            && (record.handshake_try <= self.max_tries
                || record.handshake_err.as_deref() == Some(self.transient_err.as_str()))
    }

    fn is_quiet(&self, record: &NodeRecord, cutoffs: &HandshakeCutoffs) -> bool {
        if let Some(claimed) = record.handshake_claimed {
            return claimed < cutoffs.err_before;
        }
        match record.handshake_updated {
            None => true,
            Some(updated) if record.handshake_err.is_none() => updated < cutoffs.ok_before,
            Some(updated) => updated < cutoffs.err_before,
        }
    }
}

/// Absolute timestamps a handshake must predate to be re-eligible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeCutoffs {
    pub ok_before: DateTime<Utc>,
    pub err_before: DateTime<Utc>,
}

/// Candidate order: never attempted first, then stalest, then by id
pub fn priority(a: &NodeRecord, b: &NodeRecord) -> Ordering {
    a.handshake_updated
        .cmp(&b.handshake_updated)
        .then_with(|| a.id.cmp(&b.id))
}
