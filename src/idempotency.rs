//! Idempotency keys and the reserve/complete protocol
//!
//! A caller reserves a key before running a side effect and completes it with
//! the result afterwards. Replays of a completed key get the stored result
//! back; replays of a key still executing are told so. An in-progress record
//! older than the staleness threshold belongs to a crashed worker and is
//! reclaimed by the next caller.

use crate::{
    ActorId, Clock, IdempotencyConfig, IdempotencyRecord, IdempotencyStatus, IdempotencyStore,
    PairingError, RequestId, StoreError,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Idempotency key for deduplicating side effects
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub Box<str>);

impl IdempotencyKey {
    /// Use a caller-supplied token verbatim
    pub fn from_token(token: impl Into<Box<str>>) -> Self {
        Self(token.into())
    }

    /// Hash operation, actor, parameters and time window into a key.
    ///
    /// Identical inputs inside the same window produce the same key.
    pub fn derive(operation: &str, actor: &ActorId, params: &[&str], window_start_millis: u64) -> Self {
        let mut hasher = Sha256::new();
        for part in [operation, actor.as_str()].into_iter().chain(params.iter().copied()) {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.update(window_start_millis.to_be_bytes());
        Self(format!("{operation}:{:x}", hasher.finalize()).into_boxed_str())
    }

    /// Key for one actor's resolve action on one request
    pub fn for_resolve(request_id: RequestId, actor: &ActorId, action: &str, window_start_millis: u64) -> Self {
        let id = request_id.to_string();
        Self::derive("resolve", actor, &[&id, action], window_start_millis)
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of reserving a key
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reservation {
    /// The caller owns the key and must run the operation
    Acquired {
        /// The key was taken over from an abandoned in-progress record
        reclaimed: bool,
    },
    /// The operation already ran; here is what it returned
    Completed {
        /// Encoded result stored by the first caller
        result: Option<Vec<u8>>,
    },
    /// Another caller is running the operation right now
    InProgress,
}

impl Reservation {
    /// Check if another call already owns or finished the key
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, Self::Acquired { .. })
    }

    /// Stored result of a completed key
    pub fn previous_result(&self) -> Option<&[u8]> {
        match self {
            Self::Completed { result } => result.as_deref(),
            _ => None,
        }
    }
}

// insert, inspect, reclaim, insert again
const MAX_RESERVE_ROUNDS: usize = 3;

/// Reserve/complete front end over an [`IdempotencyStore`]
pub struct IdempotencyManager {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
    clock: Arc<dyn Clock>,
}

impl IdempotencyManager {
    /// Create a manager over `store`
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock }
    }

    /// Derive a key bucketed into the configured time window
    pub fn derive_key(&self, operation: &str, actor: &ActorId, params: &[&str]) -> IdempotencyKey {
        let now = self.clock.now_millis();
        let window = now - now % self.config.key_window_millis;
        IdempotencyKey::derive(operation, actor, params, window)
    }

    /// Claim `key` for `operation`.
    ///
    /// A key already held by a different operation is a caller error.
    pub fn reserve(&self, key: &IdempotencyKey, operation: &str) -> Result<Reservation, PairingError> {
        let mut reclaimed = false;
        for _ in 0..MAX_RESERVE_ROUNDS {
            let now = self.clock.now_millis();
            let fresh = IdempotencyRecord {
                key: key.as_str().to_owned(),
                operation: operation.to_owned(),
                status: IdempotencyStatus::InProgress,
                result: None,
                created_at_millis: now,
            };
            if self.store.insert_if_absent(fresh)? {
                return Ok(Reservation::Acquired { reclaimed });
            }

            // Someone holds the key; a vanished record just means we retry the insert
            let Some(existing) = self.store.get(key)? else {
                continue;
            };
            if existing.operation != operation {
                return Err(PairingError::validation(format!(
                    "idempotency key {key} was used for {}, not {operation}",
                    existing.operation
                )));
            }
            match existing.status {
                IdempotencyStatus::Completed => {
                    tracing::debug!(key = %key, "Idempotent replay");
                    return Ok(Reservation::Completed {
                        result: existing.result,
                    });
                }
                IdempotencyStatus::InProgress
                    if now.saturating_sub(existing.created_at_millis) < self.config.stale_after_millis =>
                {
                    return Ok(Reservation::InProgress);
                }
                IdempotencyStatus::InProgress => {
                    tracing::warn!(
                        key = %key,
                        age_ms = now.saturating_sub(existing.created_at_millis),
                        "Reclaiming abandoned idempotency record"
                    );
                    self.store.remove_if_created_at(key, existing.created_at_millis)?;
                    reclaimed = true;
                }
                IdempotencyStatus::Failed => {
                    // The effect never happened; let this caller retry it
                    self.store.remove_if_created_at(key, existing.created_at_millis)?;
                }
            }
        }
        // Lost every race for the key to other reclaimers
        Ok(Reservation::InProgress)
    }

    /// Finalize `key` with the operation's result
    pub fn complete(&self, key: &IdempotencyKey, result: Vec<u8>) -> Result<bool, StoreError> {
        let done = self.store.finalize(key, IdempotencyStatus::Completed, Some(result))?;
        if !done {
            tracing::warn!(key = %key, "Completing idempotency key that is not in progress");
        }
        Ok(done)
    }

    /// Mark `key` failed so a later retry may run the operation again
    pub fn fail(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        self.store.finalize(key, IdempotencyStatus::Failed, None)
    }

    /// Delete records past the retention window
    pub fn collect_garbage(&self) -> Result<usize, StoreError> {
        let cutoff = self.clock.now_millis().saturating_sub(self.config.retention_millis);
        let purged = self.store.purge_older_than(cutoff)?;
        if purged > 0 {
            tracing::debug!(purged, "Purged idempotency records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryIdempotencyStore, ManualClock};

    fn manager() -> (Arc<ManualClock>, IdempotencyManager) {
        let clock = Arc::new(ManualClock::new(10_000_000));
        let manager = IdempotencyManager::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            IdempotencyConfig::default(),
            clock.clone(),
        );
        (clock, manager)
    }

    #[test]
    fn derived_keys_are_deterministic() {
        let actor = ActorId::new("alice");
        let a = IdempotencyKey::for_resolve(RequestId(1), &actor, "accept", 60_000);
        let b = IdempotencyKey::for_resolve(RequestId(1), &actor, "accept", 60_000);
        let other_window = IdempotencyKey::for_resolve(RequestId(1), &actor, "accept", 120_000);
        let other_action = IdempotencyKey::for_resolve(RequestId(1), &actor, "cancel", 60_000);
        assert_eq!(a, b);
        assert_ne!(a, other_window);
        assert_ne!(a, other_action);
        assert!(a.as_str().starts_with("resolve:"));
    }

    #[test]
    fn derive_does_not_confuse_boundaries() {
        let actor = ActorId::new("x");
        let a = IdempotencyKey::derive("op", &actor, &["ab", "c"], 0);
        let b = IdempotencyKey::derive("op", &actor, &["a", "bc"], 0);
        assert_ne!(a, b);
    }

    #[test]
    fn reserve_then_replay() {
        let (_clock, manager) = manager();
        let key = IdempotencyKey::from_token("tok-1");
        assert_eq!(
            manager.reserve(&key, "resolve").unwrap(),
            Reservation::Acquired { reclaimed: false }
        );
        assert_eq!(manager.reserve(&key, "resolve").unwrap(), Reservation::InProgress);

        assert!(manager.complete(&key, b"done".to_vec()).unwrap());
        let replay = manager.reserve(&key, "resolve").unwrap();
        assert!(replay.is_duplicate());
        assert_eq!(replay.previous_result(), Some(&b"done"[..]));
    }

    #[test]
    fn stale_in_progress_is_reclaimed() {
        let (clock, manager) = manager();
        let key = IdempotencyKey::from_token("tok-2");
        manager.reserve(&key, "resolve").unwrap();

        clock.advance_millis(IdempotencyConfig::default().stale_after_millis - 1);
        assert_eq!(manager.reserve(&key, "resolve").unwrap(), Reservation::InProgress);

        clock.advance_millis(1);
        assert_eq!(
            manager.reserve(&key, "resolve").unwrap(),
            Reservation::Acquired { reclaimed: true }
        );
    }

    #[test]
    fn key_cannot_cross_operations() {
        let (_clock, manager) = manager();
        let key = IdempotencyKey::from_token("tok-6");
        manager.reserve(&key, "create_request").unwrap();
        manager.complete(&key, b"created".to_vec()).unwrap();

        let err = manager.reserve(&key, "resolve_request").unwrap_err();
        assert!(matches!(err, PairingError::Validation(_)));
        assert!(manager.reserve(&key, "create_request").unwrap().is_duplicate());
    }

    #[test]
    fn failed_record_allows_retry() {
        let (_clock, manager) = manager();
        let key = IdempotencyKey::from_token("tok-3");
        manager.reserve(&key, "resolve").unwrap();
        assert!(manager.fail(&key).unwrap());
        assert_eq!(
            manager.reserve(&key, "resolve").unwrap(),
            Reservation::Acquired { reclaimed: false }
        );
    }

    #[test]
    fn garbage_collection_honors_retention() {
        let (clock, manager) = manager();
        let key = IdempotencyKey::from_token("tok-4");
        manager.reserve(&key, "resolve").unwrap();
        manager.complete(&key, vec![]).unwrap();

        assert_eq!(manager.collect_garbage().unwrap(), 0);
        clock.advance_millis(IdempotencyConfig::default().retention_millis + 1);
        assert_eq!(manager.collect_garbage().unwrap(), 1);
        assert_eq!(
            manager.reserve(&key, "resolve").unwrap(),
            Reservation::Acquired { reclaimed: false }
        );
    }

    #[test]
    fn concurrent_reservations_have_one_winner() {
        let (_clock, manager) = manager();
        let manager = Arc::new(manager);
        let key = IdempotencyKey::from_token("tok-5");
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let key = key.clone();
                std::thread::spawn(move || manager.reserve(&key, "resolve").unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| !r.is_duplicate())
            .count();
        assert_eq!(winners, 1);
    }
}
