//! Tunable limits for every component
//!
//! The numbers here are product constants. Defaults match the documented
//! behavior; hosts override them by deserializing a [`PairingConfig`].

use crate::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MINUTE_MILLIS: u64 = 60 * 1000;
const DAY_MILLIS: u64 = 24 * 60 * MINUTE_MILLIS;

/// Top-level configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Request lifetimes and sweeping
    pub ledger: LedgerConfig,
    /// Optimistic concurrency retries
    pub retry: RetryPolicy,
    /// Token buckets
    pub rate_limit: RateLimitConfig,
    /// Key staleness and retention
    pub idempotency: IdempotencyConfig,
    /// Report and violation handling
    pub abuse: AbuseConfig,
}

impl PairingConfig {
    /// Reject configurations the components cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ledger.validate()?;
        self.retry.validate()?;
        self.rate_limit.validate()?;
        self.idempotency.validate()?;
        self.abuse.validate()
    }
}

/// Request ledger limits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// TTL applied when the caller passes none
    pub default_ttl_secs: u64,
    /// Shortest TTL a caller may ask for
    pub min_ttl_secs: u64,
    /// Longest TTL a caller may ask for
    pub max_ttl_secs: u64,
    /// Rows claimed per sweep call
    pub sweep_batch: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 60,
            min_ttl_secs: 1,
            max_ttl_secs: 24 * 60 * 60,
            sweep_batch: 512,
        }
    }
}

impl LedgerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_ttl_secs == 0 {
            return Err(ConfigError::invalid("ledger.min_ttl_secs", "must be positive"));
        }
        if self.min_ttl_secs > self.max_ttl_secs {
            return Err(ConfigError::invalid("ledger.max_ttl_secs", "must be >= min_ttl_secs"));
        }
        if !(self.min_ttl_secs..=self.max_ttl_secs).contains(&self.default_ttl_secs) {
            return Err(ConfigError::invalid(
                "ledger.default_ttl_secs",
                "must lie within [min_ttl_secs, max_ttl_secs]",
            ));
        }
        if self.sweep_batch == 0 {
            return Err(ConfigError::invalid("ledger.sweep_batch", "must be positive"));
        }
        Ok(())
    }
}

/// Retry policy for optimistic-concurrency conflicts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Initial delay before first retry (milliseconds)
    pub initial_delay_millis: u64,
    /// Maximum delay cap (milliseconds)
    pub max_delay_millis: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomized away, in [0, 1]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_millis: 5,
            max_delay_millis: 100,
            backoff_multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Calculate the un-jittered delay for a given attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let delay = self.initial_delay_millis as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = delay.min(self.max_delay_millis as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay for `attempt` with a random share of up to `jitter` removed
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let cut = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        base.mul_f64(1.0 - cut)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid("retry.jitter", "must lie within [0, 1]"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.backoff_multiplier", "must be >= 1"));
        }
        Ok(())
    }
}

/// Capacity and refill speed of one token bucket
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum tokens held
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl BucketConfig {
    fn validate(&self, field: &'static str, max_cost: u32) -> Result<(), ConfigError> {
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err(ConfigError::invalid(field, "refill_rate must be positive"));
        }
        if !(self.capacity.is_finite() && self.capacity >= f64::from(max_cost)) {
            return Err(ConfigError::invalid(
                field,
                format!("capacity must cover the largest operation cost ({max_cost})"),
            ));
        }
        Ok(())
    }
}

/// Token cost per operation class
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationCosts {
    /// Cost of a read
    pub read: u32,
    /// Cost of a state change
    pub mutation: u32,
    /// Cost of a listing
    pub fan_out: u32,
}

impl Default for OperationCosts {
    fn default() -> Self {
        Self {
            read: 1,
            mutation: 2,
            fan_out: 3,
        }
    }
}

impl OperationCosts {
    fn max(&self) -> u32 {
        self.read.max(self.mutation).max(self.fan_out)
    }
}

/// Admission control limits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Shared bucket
    pub global: BucketConfig,
    /// Bucket each actor gets
    pub per_actor: BucketConfig,
    /// Tokens per operation class
    pub costs: OperationCosts,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: BucketConfig {
                capacity: 1000.0,
                refill_rate: 500.0,
            },
            per_actor: BucketConfig {
                capacity: 20.0,
                refill_rate: 1.0,
            },
            costs: OperationCosts::default(),
        }
    }
}

impl RateLimitConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let max_cost = self.costs.max();
        if self.costs.read == 0 || self.costs.mutation == 0 || self.costs.fan_out == 0 {
            return Err(ConfigError::invalid("rate_limit.costs", "costs must be positive"));
        }
        self.global.validate("rate_limit.global", max_cost)?;
        self.per_actor.validate("rate_limit.per_actor", max_cost)
    }
}

/// Idempotency record lifetimes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// An in-progress record older than this is treated as abandoned
    pub stale_after_millis: u64,
    /// Records older than this are garbage collected
    pub retention_millis: u64,
    /// Width of the time bucket folded into derived keys
    pub key_window_millis: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            stale_after_millis: 5 * MINUTE_MILLIS,
            retention_millis: 90 * DAY_MILLIS,
            key_window_millis: MINUTE_MILLIS,
        }
    }
}

impl IdempotencyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_after_millis == 0 {
            return Err(ConfigError::invalid("idempotency.stale_after_millis", "must be positive"));
        }
        if self.retention_millis < self.stale_after_millis {
            return Err(ConfigError::invalid(
                "idempotency.retention_millis",
                "must be >= stale_after_millis",
            ));
        }
        if self.key_window_millis == 0 {
            return Err(ConfigError::invalid("idempotency.key_window_millis", "must be positive"));
        }
        Ok(())
    }
}

/// What a further report does to an actor who is already muted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutedReportPolicy {
    /// Record the report, leave `muted_until` alone
    #[default]
    Ignore,
    /// Push `muted_until` to `now + report_mute_millis` if that is later
    Extend,
}

/// Report and violation thresholds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseConfig {
    /// Sliding window for counting reporters
    pub report_window_millis: u64,
    /// Distinct reporters inside the window that trigger a mute
    pub report_threshold: usize,
    /// Mute length once the threshold is reached
    pub report_mute_millis: u64,
    /// What reports against a muted actor do
    pub muted_report_policy: MutedReportPolicy,
    /// Mute per violation count; `0` means warning only. The last step
    /// repeats for every further violation.
    pub escalation_millis: Vec<u64>,
    /// Forget violations after this long without a new one; `None` keeps them
    pub violation_reset_millis: Option<u64>,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            report_window_millis: 10 * MINUTE_MILLIS,
            report_threshold: 3,
            report_mute_millis: 30 * MINUTE_MILLIS,
            muted_report_policy: MutedReportPolicy::Ignore,
            escalation_millis: vec![0, 10 * MINUTE_MILLIS, 60 * MINUTE_MILLIS],
            violation_reset_millis: None,
        }
    }
}

impl AbuseConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.report_threshold == 0 {
            return Err(ConfigError::invalid("abuse.report_threshold", "must be positive"));
        }
        if self.report_window_millis == 0 {
            return Err(ConfigError::invalid("abuse.report_window_millis", "must be positive"));
        }
        if self.escalation_millis.is_empty() {
            return Err(ConfigError::invalid("abuse.escalation_millis", "needs at least one step"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay() {
        let policy = RetryPolicy {
            initial_delay_millis: 1000,
            max_delay_millis: 30000,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(0));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert!(policy.delay_for_attempt(10) <= Duration::from_millis(30000));
    }

    #[test]
    fn jitter_only_shortens() {
        let policy = RetryPolicy::default();
        for attempt in 1..=3 {
            let base = policy.delay_for_attempt(attempt);
            let jittered = policy.jittered_delay(attempt);
            assert!(jittered <= base);
            assert!(jittered >= base.mul_f64(0.5));
        }
    }

    #[test]
    fn defaults_validate() {
        PairingConfig::default().validate().unwrap();
    }

    #[test]
    fn capacity_must_cover_largest_cost() {
        let mut config = PairingConfig::default();
        config.rate_limit.per_actor.capacity = 2.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rate_limit.per_actor"));
    }

    #[test]
    fn zero_refill_rejected() {
        let mut config = PairingConfig::default();
        config.rate_limit.global.refill_rate = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_ttl_must_be_in_range() {
        let mut config = PairingConfig::default();
        config.ledger.default_ttl_secs = config.ledger.max_ttl_secs + 1;
        assert!(config.validate().is_err());
    }
}
