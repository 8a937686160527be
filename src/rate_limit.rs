//! Token-bucket admission control
//!
//! One global bucket shields shared downstream resources and one bucket per
//! actor keeps things fair. Each bucket refills and debits under its own
//! mutex; the two checks run one after the other and never hold both locks.

use crate::{ActorId, BucketConfig, Clock, OperationCosts, PairingError, RateLimitConfig, Registry, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Which bucket made a decision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateScope {
    /// The shared bucket in front of downstream resources
    Global,
    /// The caller's own bucket
    Actor,
}

impl std::fmt::Display for RateScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Actor => f.write_str("actor"),
        }
    }
}

/// Cost class of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationClass {
    /// Lightweight read
    Read,
    /// State mutation
    Mutation,
    /// Heavier fan-out
    FanOut,
}

impl OperationClass {
    /// Tokens this class debits
    pub fn cost(&self, costs: &OperationCosts) -> u32 {
        match self {
            Self::Read => costs.read,
            Self::Mutation => costs.mutation,
            Self::FanOut => costs.fan_out,
        }
    }
}

/// A single token bucket; `0 <= tokens <= capacity` at all times
#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill_millis: u64,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(config: BucketConfig, now_millis: u64) -> Self {
        Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            tokens: config.capacity,
            last_refill_millis: now_millis,
        }
    }

    fn refill(&mut self, now_millis: u64) {
        // A clock stepping backwards refills nothing
        let elapsed = now_millis.saturating_sub(self.last_refill_millis);
        if elapsed > 0 {
            let added = self.refill_rate * (elapsed as f64 / 1000.0);
            self.tokens = (self.tokens + added).min(self.capacity);
            self.last_refill_millis = now_millis;
        }
    }

    /// Refill, then debit `cost` if available.
    ///
    /// On denial returns the whole seconds until `cost` tokens will exist.
    pub fn try_take(&mut self, cost: u32, now_millis: u64) -> Result<(), u64> {
        self.refill(now_millis);
        let cost = f64::from(cost);
        if self.tokens >= cost {
            self.tokens -= cost;
            return Ok(());
        }
        let missing = cost - self.tokens;
        Err(((missing / self.refill_rate).ceil() as u64).max(1))
    }

    /// Return tokens debited for a call that was denied further downstream
    pub fn give_back(&mut self, cost: u32) {
        self.tokens = (self.tokens + f64::from(cost)).min(self.capacity);
    }

    /// Tokens left as of the last refill
    pub fn available(&self) -> f64 {
        self.tokens
    }

    /// Maximum tokens held
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Outcome of a rate check; denial is a normal result, not an error
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateDecision {
    /// The call may proceed
    pub allowed: bool,
    /// Seconds to wait after a denial
    pub retry_after_secs: u64,
    /// Bucket that denied, if any
    pub denied_by: Option<RateScope>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
            denied_by: None,
        }
    }

    fn deny(scope: RateScope, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs,
            denied_by: Some(scope),
        }
    }

    /// Convert a denial into `PairingError::RateLimited`
    pub fn into_result(self) -> Result<(), PairingError> {
        match self.denied_by {
            None => Ok(()),
            Some(scope) => Err(PairingError::RateLimited {
                scope,
                retry_after_secs: self.retry_after_secs,
            }),
        }
    }
}

/// Global plus per-actor token buckets
pub struct RateLimiter {
    config: RateLimitConfig,
    global: Mutex<TokenBucket>,
    actors: Registry<ActorId, Mutex<TokenBucket>>,
    clock: Arc<dyn Clock>,
    denied: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter with a full global bucket
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let global = Mutex::new(TokenBucket::new(config.global, clock.now_millis()));
        Self {
            config,
            global,
            actors: Registry::new(),
            clock,
            denied: AtomicU64::new(0),
        }
    }

    /// Check and debit the actor's bucket, then the global one.
    ///
    /// If the global bucket denies, the actor's debit is refunded so a
    /// global brown-out does not drain individual budgets.
    pub fn check(&self, actor: &ActorId, class: OperationClass) -> Result<RateDecision, StoreError> {
        let cost = class.cost(&self.config.costs);
        let now = self.clock.now_millis();

        let bucket = self
            .actors
            .get_or_insert_with(actor, || Mutex::new(TokenBucket::new(self.config.per_actor, now)))?;

        let taken = bucket.lock().map_err(StoreError::poisoned)?.try_take(cost, now);
        if let Err(retry_after) = taken {
            return Ok(self.denied(actor, RateScope::Actor, retry_after));
        }

        let taken = self.global.lock().map_err(StoreError::poisoned)?.try_take(cost, now);
        if let Err(retry_after) = taken {
            bucket.lock().map_err(StoreError::poisoned)?.give_back(cost);
            return Ok(self.denied(actor, RateScope::Global, retry_after));
        }

        tracing::trace!(actor = %actor, ?class, cost, "Rate check passed");
        Ok(RateDecision::allow())
    }

    /// Like [`check`](Self::check) but folds a denial into the error type
    pub fn admit(&self, actor: &ActorId, class: OperationClass) -> Result<(), PairingError> {
        self.check(actor, class)?.into_result()
    }

    fn denied(&self, actor: &ActorId, scope: RateScope, retry_after_secs: u64) -> RateDecision {
        self.denied.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(actor = %actor, %scope, retry_after_secs, "Rate limited");
        RateDecision::deny(scope, retry_after_secs)
    }

    /// Tokens left in the actor's bucket, if it exists yet
    pub fn actor_tokens(&self, actor: &ActorId) -> Result<Option<f64>, StoreError> {
        match self.actors.get(actor)? {
            Some(bucket) => Ok(Some(bucket.lock().map_err(StoreError::poisoned)?.available())),
            None => Ok(None),
        }
    }

    /// Total denials since construction
    pub fn denied_count(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    /// Forget actor buckets that have refilled to capacity and that no
    /// in-flight check is holding
    pub fn prune_idle(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        self.actors.retain_idle(|_, bucket| match bucket.lock() {
            Ok(mut b) => {
                b.refill(now);
                b.available() < b.capacity()
            }
            Err(_) => false,
        })
    }

    /// Teardown: drop every actor bucket and refill the global one
    pub fn reset(&self) -> Result<(), StoreError> {
        self.actors.clear()?;
        *self.global.lock().map_err(StoreError::poisoned)? =
            TokenBucket::new(self.config.global, self.clock.now_millis());
        Ok(())
    }
}
