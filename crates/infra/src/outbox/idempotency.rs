//! Per-(event, consumer) idempotency guard.

use std::future::Future;

use tracing::debug;

use courier_core::EventId;
use courier_events::ConsumerError;

use super::store::ConsumerLedger;

/// What [`IdempotencyGuard::apply_once`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The action ran and the ledger entry was written.
    Applied,
    /// A ledger entry already existed; the action was skipped.
    AlreadyApplied,
}

/// Runs a consumer action at most once per `(event_id, consumer_name)`,
/// as far as the ledger can tell.
///
/// The entry is written after the action succeeds. A crash in between means
/// the action runs again on redelivery.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard<L> {
    ledger: L,
}

impl<L: ConsumerLedger> IdempotencyGuard<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Ledger failures come back as retryable errors: running the consumer
    /// again is always safe, skipping it is not.
    pub async fn apply_once<F, Fut>(
        &self,
        event_id: EventId,
        consumer: &str,
        action: F,
    ) -> Result<Applied, ConsumerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ConsumerError>>,
    {
        let seen = self
            .ledger
            .has_applied(event_id, consumer)
            .await
            .map_err(|e| ConsumerError::retryable(format!("ledger lookup failed: {e}")))?;
        if seen {
            debug!(event_id = %event_id, consumer, "already applied, skipping");
            return Ok(Applied::AlreadyApplied);
        }

        action().await?;

        self.ledger
            .record_applied(event_id, consumer)
            .await
            .map_err(|e| ConsumerError::retryable(format!("ledger insert failed: {e}")))?;
        Ok(Applied::Applied)
    }
}
