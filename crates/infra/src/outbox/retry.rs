//! Bounded retry with backoff around one delivery attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use courier_events::ConsumerError;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// An error the retry loop can classify.
pub trait RetryableError: core::fmt::Display {
    fn is_retryable(&self) -> bool;

    /// The error recorded when an attempt exceeds its deadline.
    fn timed_out(after: Duration) -> Self;

    /// The error recorded when the budget was already spent before this call.
    fn exhausted(attempts: u32) -> Self;
}

impl RetryableError for ConsumerError {
    fn is_retryable(&self) -> bool {
        ConsumerError::is_retryable(self)
    }

    fn timed_out(after: Duration) -> Self {
        ConsumerError::TimedOut(after)
    }

    fn exhausted(attempts: u32) -> Self {
        ConsumerError::permanent(format!("retry budget exhausted after {attempts} attempts"))
    }
}

/// Classification of a single attempt's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptClass {
    Success,
    RetryableFailure,
    PermanentFailure,
}

/// Final result of [`RetryPolicy::execute`]. `attempts` is the total count,
/// including the `prior_attempts` passed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    Success { value: T, attempts: u32 },
    PermanentFailure { error: E, attempts: u32 },
    /// Cancellation was observed between attempts.
    Interrupted { last_error: Option<E>, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. }
            | RetryOutcome::PermanentFailure { attempts, .. }
            | RetryOutcome::Interrupted { attempts, .. } => *attempts,
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, first one included (>= 1)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
    /// Deadline for a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            ..Default::default()
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * (attempt as f64)).min(max_ms),
        };

        // Deterministic jitter keyed on the attempt number
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Upper bound on the time one record can spend in [`execute`](Self::execute):
    /// every attempt timing out, each followed by the longest jittered backoff.
    pub fn worst_case_duration(&self) -> Duration {
        let backoff = self.max_delay.mul_f64(1.0 + self.jitter.clamp(0.0, 1.0));
        self.attempt_timeout
            .saturating_add(backoff)
            .saturating_mul(self.max_attempts)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn classify<T, E: RetryableError>(&self, attempt: u32, result: &Result<T, E>) -> AttemptClass {
        match result {
            Ok(_) => AttemptClass::Success,
            Err(err) if !err.is_retryable() || !self.should_retry(attempt) => {
                AttemptClass::PermanentFailure
            }
            Err(_) => AttemptClass::RetryableFailure,
        }
    }

    /// Run `action` for attempts `prior_attempts + 1 ..= max_attempts`.
    ///
    /// `action` receives the 1-indexed attempt number. Each attempt is bounded
    /// by `attempt_timeout`; a timeout counts as a retryable failure. Between
    /// attempts the loop sleeps the backoff delay unless `cancel` fires first.
    pub async fn execute<T, E, F, Fut>(
        &self,
        prior_attempts: u32,
        cancel: &CancellationToken,
        mut action: F,
    ) -> RetryOutcome<T, E>
    where
        E: RetryableError,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.should_retry(prior_attempts) {
            return RetryOutcome::PermanentFailure {
                error: E::exhausted(prior_attempts),
                attempts: prior_attempts,
            };
        }

        let mut attempt = prior_attempts;
        let mut last_error = None;
        loop {
            if cancel.is_cancelled() {
                return RetryOutcome::Interrupted {
                    last_error,
                    attempts: attempt,
                };
            }

            attempt += 1;
            let result = match tokio::time::timeout(self.attempt_timeout, action(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(self.attempt_timeout)),
            };

            let class = self.classify(attempt, &result);
            let error = match result {
                Ok(value) => return RetryOutcome::Success { value, attempts: attempt },
                Err(error) => error,
            };
            if class == AttemptClass::PermanentFailure {
                return RetryOutcome::PermanentFailure {
                    error,
                    attempts: attempt,
                };
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return RetryOutcome::Interrupted {
                        last_error: Some(error),
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            last_error = Some(error);
        }
    }
}
