//! Core statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters for the pairing core
pub struct CoreStats {
    /// Requests stored
    pub requests_created: AtomicU64,
    /// Transitions written
    pub transitions_committed: AtomicU64,
    /// Requests expired by sweep or on access
    pub requests_expired: AtomicU64,
    /// Lost conditional writes that were retried
    pub conflict_retries: AtomicU64,
    /// Mutations that ran out of retries
    pub conflicts_exhausted: AtomicU64,
    /// Calls answered from an idempotency record
    pub idempotent_replays: AtomicU64,
    /// Calls denied by a bucket
    pub rate_limited: AtomicU64,
    /// Mutations refused because the actor was muted
    pub muted_rejections: AtomicU64,
    /// Notices delivered
    pub notifications_sent: AtomicU64,
    /// Notices the dispatcher refused
    pub notifications_failed: AtomicU64,
}

impl CoreStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self {
            requests_created: AtomicU64::new(0),
            transitions_committed: AtomicU64::new(0),
            requests_expired: AtomicU64::new(0),
            conflict_retries: AtomicU64::new(0),
            conflicts_exhausted: AtomicU64::new(0),
            idempotent_replays: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            muted_rejections: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> CoreStatsSnapshot {
        CoreStatsSnapshot {
            requests_created: self.requests_created.load(Ordering::Relaxed),
            transitions_committed: self.transitions_committed.load(Ordering::Relaxed),
            requests_expired: self.requests_expired.load(Ordering::Relaxed),
            conflict_retries: self.conflict_retries.load(Ordering::Relaxed),
            conflicts_exhausted: self.conflicts_exhausted.load(Ordering::Relaxed),
            idempotent_replays: self.idempotent_replays.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            muted_rejections: self.muted_rejections.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for CoreStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Point-in-time copy of [`CoreStats`]
pub struct CoreStatsSnapshot {
    /// Requests stored
    pub requests_created: u64,
    /// Transitions written
    pub transitions_committed: u64,
    /// Requests expired by sweep or on access
    pub requests_expired: u64,
    /// Lost conditional writes that were retried
    pub conflict_retries: u64,
    /// Mutations that ran out of retries
    pub conflicts_exhausted: u64,
    /// Calls answered from an idempotency record
    pub idempotent_replays: u64,
    /// Calls denied by a bucket
    pub rate_limited: u64,
    /// Mutations refused because the actor was muted
    pub muted_rejections: u64,
    /// Notices delivered
    pub notifications_sent: u64,
    /// Notices the dispatcher refused
    pub notifications_failed: u64,
}
