//! Read-validate-write cycle for request mutations
//!
//! A mutation takes the in-process lock for its request ID, re-reads the
//! record, asks the caller's decision function what to do, and writes with a
//! version-conditioned compare-and-swap. The lock only serializes callers in
//! this process; the CAS is what protects against other instances and the
//! expiry sweep. A CAS miss releases the lock, backs off with jitter and
//! starts over with a fresh read.

use crate::{
    CoreStats, PairingError, PairingObserver, PairingRequest, Plan, Registry, RequestId,
    RequestStore, RetryPolicy, StoreError,
};
use std::sync::Arc;
use tokio::sync::Mutex;

/// What a committed (or replayed) mutation left behind
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// This caller's write won
    Applied(PairingRequest),
    /// The record already reflected the action; nothing was written
    Settled(PairingRequest),
    /// The deadline had passed; this caller wrote the expiry
    ExpiredOnAccess(PairingRequest),
}

impl Mutation {
    /// The record after the call
    pub fn record(&self) -> &PairingRequest {
        match self {
            Self::Applied(r) | Self::Settled(r) | Self::ExpiredOnAccess(r) => r,
        }
    }

    /// Take the record after the call
    pub fn into_record(self) -> PairingRequest {
        match self {
            Self::Applied(r) | Self::Settled(r) | Self::ExpiredOnAccess(r) => r,
        }
    }

    /// Whether this call wrote a new version
    pub fn committed(&self) -> bool {
        !matches!(self, Self::Settled(_))
    }
}

/// Serializes and validates mutations per request ID
pub struct ConcurrencyController {
    store: Arc<dyn RequestStore>,
    locks: Registry<RequestId, Mutex<()>>,
    retry: RetryPolicy,
    observer: Arc<dyn PairingObserver>,
    stats: Arc<CoreStats>,
}

impl ConcurrencyController {
    /// Create a controller over `store`
    pub fn new(
        store: Arc<dyn RequestStore>,
        retry: RetryPolicy,
        observer: Arc<dyn PairingObserver>,
        stats: Arc<CoreStats>,
    ) -> Self {
        Self {
            store,
            locks: Registry::new(),
            retry,
            observer,
            stats,
        }
    }

    /// Run one guarded mutation on `id`.
    ///
    /// `decide` sees the freshest record on every attempt. Its errors are
    /// returned as-is without retrying.
    pub async fn mutate<F>(&self, id: RequestId, mut decide: F) -> Result<Mutation, PairingError>
    where
        F: FnMut(&PairingRequest) -> Result<Plan, PairingError>,
    {
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(mutation) = self.attempt(id, &mut decide).await? {
                return Ok(mutation);
            }

            CoreStats::bump(&self.stats.conflict_retries);
            self.observer.on_conflict_retry(id, attempt);
            if attempt < attempts {
                tokio::time::sleep(self.retry.jittered_delay(attempt)).await;
            }
        }

        CoreStats::bump(&self.stats.conflicts_exhausted);
        self.observer.on_conflict_exhausted(id, attempts);
        Err(PairingError::Conflict {
            request_id: id,
            attempts,
        })
    }

    /// One locked read-validate-write. `Ok(None)` means the CAS lost.
    async fn attempt<F>(&self, id: RequestId, decide: &mut F) -> Result<Option<Mutation>, PairingError>
    where
        F: FnMut(&PairingRequest) -> Result<Plan, PairingError>,
    {
        let lock = self.locks.get_or_insert_with(&id, || Mutex::new(()))?;
        let _guard = lock.lock().await;

        let current = self.store.get(id)?.ok_or(PairingError::NotFound(id))?;
        let (next, expired) = match decide(&current)? {
            Plan::Settled => return Ok(Some(Mutation::Settled(current))),
            Plan::Apply(next) => (next, false),
            Plan::ExpireAndReject(next) => (next, true),
        };
        debug_assert_eq!(next.version, current.version + 1);

        if !self.store.compare_and_swap(current.version, &next)? {
            return Ok(None);
        }
        CoreStats::bump(&self.stats.transitions_committed);
        Ok(Some(if expired {
            Mutation::ExpiredOnAccess(next)
        } else {
            Mutation::Applied(next)
        }))
    }

    /// Forget locks for requests nobody is mutating
    pub fn prune_locks(&self) -> Result<usize, StoreError> {
        self.locks.prune_unused()
    }

    /// The backing store
    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }
}
