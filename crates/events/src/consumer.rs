//! Event consumers (the "handlers" the dispatch loop delivers to).

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{Event, EventEnvelope};

/// Failure reported by a consumer.
///
/// The variant decides retry classification:
/// - `Retryable`: transient (dependency down, lock contention); retried with backoff
/// - `Permanent`: retrying cannot help without a code or data change
/// - `TimedOut`: the attempt exceeded its deadline; treated as retryable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumerError {
    #[error("transient failure: {0}")]
    Retryable(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
}

impl ConsumerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConsumerError::Permanent(_))
    }

    /// Prefix the message with the consumer that produced it.
    pub fn in_consumer(self, consumer: &str) -> Self {
        match self {
            ConsumerError::Retryable(msg) => ConsumerError::Retryable(format!("{consumer}: {msg}")),
            ConsumerError::Permanent(msg) => ConsumerError::Permanent(format!("{consumer}: {msg}")),
            timed_out @ ConsumerError::TimedOut(_) => timed_out,
        }
    }
}

/// Reacts to one event type.
///
/// Delivery is at-least-once. The dispatch loop records `(event_id, name())`
/// in the consumer ledger after `handle` succeeds and skips the consumer on
/// redelivery, so `name()` must be stable across deploys: renaming a consumer
/// makes it see every already-delivered event again.
///
/// A crash between a successful `handle` and the ledger write re-runs the
/// consumer; side effects should tolerate that.
#[async_trait]
pub trait EventConsumer<E: Event>: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &EventEnvelope<E>) -> Result<(), ConsumerError>;
}
