//! Outbox configuration from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `COURIER_BATCH_SIZE` | 20 |
//! | `COURIER_MAX_ATTEMPTS` | 5 |
//! | `COURIER_BACKOFF_BASE_MS` | 500 |
//! | `COURIER_BACKOFF_MAX_MS` | 5000 |
//! | `COURIER_ATTEMPT_TIMEOUT_MS` | 10000 |
//! | `COURIER_STALE_AFTER_MINUTES` | 30 |
//! | `COURIER_DISPATCH_INTERVAL_SECS` | 5 |
//! | `COURIER_RECLAIM_INTERVAL_SECS` | 600 |
//!
//! A whole batch is claimed with one stamp, so the stale threshold must
//! exceed the worst-case time to work through a batch:
//! `batch_size x max_attempts x (attempt_timeout + jittered max backoff)`.
//! Otherwise records still queued behind a slow one would be reclaimed and
//! failed without ever being delivered.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use courier_events::EventRegistry;

use crate::outbox::{
    ConsumerLedger, DEFAULT_BATCH_SIZE, OutboxDispatcher, OutboxStore, RetryPolicy,
    StaleClaimReclaimer,
};

pub const BATCH_SIZE: &str = "COURIER_BATCH_SIZE";
pub const MAX_ATTEMPTS: &str = "COURIER_MAX_ATTEMPTS";
pub const BACKOFF_BASE_MS: &str = "COURIER_BACKOFF_BASE_MS";
pub const BACKOFF_MAX_MS: &str = "COURIER_BACKOFF_MAX_MS";
pub const ATTEMPT_TIMEOUT_MS: &str = "COURIER_ATTEMPT_TIMEOUT_MS";
pub const STALE_AFTER_MINUTES: &str = "COURIER_STALE_AFTER_MINUTES";
pub const DISPATCH_INTERVAL_SECS: &str = "COURIER_DISPATCH_INTERVAL_SECS";
pub const RECLAIM_INTERVAL_SECS: &str = "COURIER_RECLAIM_INTERVAL_SECS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Tunables for dispatch, retry and reclaim.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxConfig {
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Claim age after which the reclaimer fails a record
    pub stale_after: chrono::Duration,
    pub dispatch_interval: Duration,
    pub reclaim_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            stale_after: chrono::Duration::minutes(30),
            dispatch_interval: Duration::from_secs(5),
            reclaim_interval: Duration::from_secs(600),
        }
    }
}

impl OutboxConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read from any key → value source. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let batch_size: usize = positive(&lookup, BATCH_SIZE, defaults.batch_size as u64)? as usize;
        let max_attempts = positive(&lookup, MAX_ATTEMPTS, u64::from(defaults.retry.max_attempts))?;
        let max_attempts = u32::try_from(max_attempts).map_err(|_| ConfigError::Invalid {
            key: MAX_ATTEMPTS,
            value: max_attempts.to_string(),
            reason: "too large".to_string(),
        })?;
        let base_ms = positive(&lookup, BACKOFF_BASE_MS, millis(defaults.retry.base_delay))?;
        let max_ms = positive(&lookup, BACKOFF_MAX_MS, millis(defaults.retry.max_delay))?;
        if max_ms < base_ms {
            return Err(ConfigError::Invalid {
                key: BACKOFF_MAX_MS,
                value: max_ms.to_string(),
                reason: format!("must be at least {BACKOFF_BASE_MS} ({base_ms})"),
            });
        }
        let timeout_ms = positive(
            &lookup,
            ATTEMPT_TIMEOUT_MS,
            millis(defaults.retry.attempt_timeout),
        )?;
        let stale_minutes = positive(
            &lookup,
            STALE_AFTER_MINUTES,
            defaults.stale_after.num_minutes().max(1) as u64,
        )?;
        let dispatch_secs = positive(
            &lookup,
            DISPATCH_INTERVAL_SECS,
            defaults.dispatch_interval.as_secs(),
        )?;
        let reclaim_secs = positive(
            &lookup,
            RECLAIM_INTERVAL_SECS,
            defaults.reclaim_interval.as_secs(),
        )?;

        let stale_after = i64::try_from(stale_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .ok_or_else(|| ConfigError::Invalid {
                key: STALE_AFTER_MINUTES,
                value: stale_minutes.to_string(),
                reason: "out of range".to_string(),
            })?;

        let config = Self {
            batch_size,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                attempt_timeout: Duration::from_millis(timeout_ms),
                ..defaults.retry
            },
            stale_after,
            dispatch_interval: Duration::from_secs(dispatch_secs),
            reclaim_interval: Duration::from_secs(reclaim_secs),
        };
        config.check_batch_fits_claim()?;
        Ok(config)
    }

    /// Worst-case time for one dispatch cycle to work through a full batch.
    pub fn worst_case_batch_duration(&self) -> Duration {
        let batch = u32::try_from(self.batch_size).unwrap_or(u32::MAX);
        self.retry.worst_case_duration().saturating_mul(batch)
    }

    fn check_batch_fits_claim(&self) -> Result<(), ConfigError> {
        let budget = self.worst_case_batch_duration();
        let fits = self
            .stale_after
            .to_std()
            .is_ok_and(|stale_after| budget < stale_after);
        if fits {
            return Ok(());
        }
        Err(ConfigError::Invalid {
            key: STALE_AFTER_MINUTES,
            value: self.stale_after.num_minutes().to_string(),
            reason: format!(
                "must exceed the worst-case batch time of {}s ({BATCH_SIZE} x {MAX_ATTEMPTS} x ({ATTEMPT_TIMEOUT_MS} + {BACKOFF_MAX_MS}))",
                budget.as_secs()
            ),
        })
    }

    pub fn dispatcher<S>(&self, store: S, registry: Arc<EventRegistry>) -> OutboxDispatcher<S>
    where
        S: OutboxStore + ConsumerLedger + Clone,
    {
        OutboxDispatcher::new(store, registry)
            .with_retry_policy(self.retry.clone())
            .with_batch_size(self.batch_size)
    }

    pub fn reclaimer<S: OutboxStore>(&self, store: S) -> StaleClaimReclaimer<S> {
        StaleClaimReclaimer::new(store).with_stale_after(self.stale_after)
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn unset_keys_use_defaults() {
        let config = OutboxConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, OutboxConfig::default());
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.retry.max_delay, Duration::from_secs(5));
        assert_eq!(config.retry.attempt_timeout, Duration::from_secs(10));
        assert_eq!(config.stale_after, chrono::Duration::minutes(30));
        assert_eq!(config.reclaim_interval, Duration::from_secs(600));
    }

    #[test]
    fn overrides_are_applied() {
        let config = OutboxConfig::from_lookup(lookup(&[
            (BATCH_SIZE, "50"),
            (MAX_ATTEMPTS, "3"),
            (BACKOFF_BASE_MS, "100"),
            (BACKOFF_MAX_MS, " 2000 "),
            (ATTEMPT_TIMEOUT_MS, "5000"),
            (STALE_AFTER_MINUTES, "60"),
            (DISPATCH_INTERVAL_SECS, "1"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(100));
        assert_eq!(config.retry.max_delay, Duration::from_millis(2000));
        assert_eq!(config.stale_after, chrono::Duration::hours(1));
        assert_eq!(config.dispatch_interval, Duration::from_secs(1));
    }

    #[test]
    fn defaults_leave_room_for_a_full_batch() {
        let config = OutboxConfig::default();
        let stale_after = config.stale_after.to_std().unwrap();
        assert!(config.worst_case_batch_duration() < stale_after);
    }

    #[test]
    fn batch_outlasting_the_stale_threshold_is_rejected() {
        // 20 x 5 x (30s + 33s) is far past 30 minutes.
        let err = OutboxConfig::from_lookup(lookup(&[
            (ATTEMPT_TIMEOUT_MS, "30000"),
            (BACKOFF_MAX_MS, "30000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: STALE_AFTER_MINUTES, .. }));

        // The same retry settings fit a smaller batch and a longer threshold.
        let config = OutboxConfig::from_lookup(lookup(&[
            (ATTEMPT_TIMEOUT_MS, "30000"),
            (BACKOFF_MAX_MS, "30000"),
            (BATCH_SIZE, "1"),
            (STALE_AFTER_MINUTES, "60"),
        ]))
        .unwrap();
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn garbage_is_rejected_with_the_key() {
        let err = OutboxConfig::from_lookup(lookup(&[(BATCH_SIZE, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: BATCH_SIZE, .. }));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = OutboxConfig::from_lookup(lookup(&[(MAX_ATTEMPTS, "0")])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value '0' for COURIER_MAX_ATTEMPTS: must be greater than zero"
        );
    }

    #[test]
    fn backoff_cap_below_base_is_rejected() {
        let err = OutboxConfig::from_lookup(lookup(&[
            (BACKOFF_BASE_MS, "1000"),
            (BACKOFF_MAX_MS, "10"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: BACKOFF_MAX_MS, .. }));
    }
}
