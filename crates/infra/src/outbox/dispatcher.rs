//! Claim-and-dispatch loop.
//!
//! One cycle claims a batch of pending records and walks them in capture
//! order. Per record:
//!
//! ```text
//! resolve type ──unknown──▶ Failed
//!      │
//! decode payload ──error──▶ Failed
//!      │
//! RetryPolicy::execute( for each consumer: IdempotencyGuard::apply_once(consumer) )
//!      ├─ success ─────────▶ Completed
//!      ├─ permanent/spent ─▶ Failed
//!      └─ cancelled ───────▶ Pending (released for a later cycle)
//! ```
//!
//! Before a record is processed its claim is renewed with a conditional
//! re-stamp; a record the reclaimer failed while it waited in the batch is
//! skipped without running any consumer. Every outcome write is conditional
//! on the renewed stamp, so a failed record is never resurrected.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::EventId;
use courier_events::{ConsumerError, DynConsumer, EventRegistry};

use super::idempotency::{Applied, IdempotencyGuard};
use super::record::{OutboxRecord, OutboxStatus};
use super::retry::{RetryOutcome, RetryPolicy};
use super::store::{ConsumerLedger, OutboxStore, OutboxStoreError};

pub const DEFAULT_BATCH_SIZE: usize = 20;

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Records claimed at the start of the cycle
    pub claimed: usize,
    pub completed: usize,
    /// Handed back to `Pending` because the cycle was cancelled
    pub released: usize,
    pub failed: usize,
    /// Outcomes not persisted: the claim was taken over, or the write failed
    pub lost: usize,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

/// Store failures that abort a cycle before any consumer runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to claim outbox records: {0}")]
    Claim(#[source] OutboxStoreError),
}

/// Delivers outbox records to the consumers registered for their type.
pub struct OutboxDispatcher<S> {
    store: S,
    guard: IdempotencyGuard<S>,
    registry: Arc<EventRegistry>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl<S> OutboxDispatcher<S>
where
    S: OutboxStore + ConsumerLedger + Clone,
{
    pub fn new(store: S, registry: Arc<EventRegistry>) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone()),
            store,
            registry,
            retry: RetryPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Claim one batch and process it.
    ///
    /// Consumer failures never abort the batch; only a failed claim does.
    /// `cancel` is checked between records and between retry attempts. Records
    /// not finished when it fires are released back to `Pending`.
    pub async fn run_dispatch_cycle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, DispatchError> {
        let claimed = self
            .store
            .claim_pending(self.batch_size, Utc::now())
            .await
            .map_err(DispatchError::Claim)?;

        let mut report = DispatchReport {
            claimed: claimed.len(),
            ..Default::default()
        };

        let mut remaining = claimed.into_iter();
        let mut interrupted_at = None;
        for mut record in remaining.by_ref() {
            if cancel.is_cancelled() {
                interrupted_at = Some(record);
                break;
            }
            let Some(claim) = record.claimed_at else {
                warn!(event_id = %record.id, "claimed record carries no claim stamp, skipping");
                report.lost += 1;
                continue;
            };
            let Some(claim) = self.renew(record.id, claim).await else {
                report.lost += 1;
                continue;
            };
            record.claimed_at = Some(claim);
            let record = self.process(record, cancel).await;
            self.persist(&record, claim, &mut report).await;
        }

        if let Some(first) = interrupted_at {
            for mut record in std::iter::once(first).chain(remaining) {
                let Some(claim) = record.claimed_at else {
                    report.lost += 1;
                    continue;
                };
                record.release(None);
                self.persist(&record, claim, &mut report).await;
            }
        }

        if !report.is_empty() {
            info!(
                claimed = report.claimed,
                completed = report.completed,
                released = report.released,
                failed = report.failed,
                lost = report.lost,
                "dispatch cycle finished"
            );
        }
        Ok(report)
    }

    /// Re-stamp a held claim; `None` when it was lost or could not be renewed.
    async fn renew(&self, id: EventId, claim: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let now = Utc::now().trunc_subsecs(6);
        match self.store.renew_claim(id, claim, now).await {
            Ok(true) => Some(now),
            Ok(false) => {
                debug!(event_id = %id, "claim lost before delivery, skipping");
                None
            }
            Err(err) => {
                warn!(event_id = %id, error = %err, "failed to renew claim, skipping");
                None
            }
        }
    }

    /// Resolve, decode, deliver. Returns the record with its new state.
    async fn process(&self, mut record: OutboxRecord, cancel: &CancellationToken) -> OutboxRecord {
        let decoded = match self
            .registry
            .resolve(&record.event_type)
            .and_then(|decoder| decoder.decode(&record.to_envelope()))
        {
            Ok(decoded) => decoded,
            Err(err) => {
                error!(
                    event_id = %record.id,
                    event_type = %record.event_type,
                    error = %err,
                    "undeliverable outbox record"
                );
                record.fail(err.to_string());
                return record;
            }
        };

        let consumers = self.registry.consumers_for(&record.event_type);
        if consumers.is_empty() {
            debug!(event_id = %record.id, event_type = %record.event_type, "no consumers registered");
            record.complete();
            return record;
        }

        let event_id = record.id;
        let event: &(dyn Any + Send + Sync) = decoded.as_ref();
        let outcome = self
            .retry
            .execute(record.retry_count, cancel, move |attempt| {
                self.deliver(event_id, event, consumers, attempt)
            })
            .await;

        match outcome {
            RetryOutcome::Success { attempts, .. } => {
                record.retry_count = attempts;
                record.complete();
                debug!(event_id = %record.id, attempts, "outbox record completed");
            }
            RetryOutcome::PermanentFailure { error, attempts } => {
                record.retry_count = attempts;
                error!(
                    event_id = %record.id,
                    event_type = %record.event_type,
                    attempts,
                    error = %error,
                    "outbox record failed"
                );
                record.fail(error.to_string());
            }
            RetryOutcome::Interrupted { last_error, attempts } => {
                record.retry_count = attempts;
                debug!(event_id = %record.id, attempts, "delivery interrupted, releasing");
                record.release(last_error.map(|e| e.to_string()));
            }
        }
        record
    }

    /// One delivery pass: every consumer not yet in the ledger, in order.
    ///
    /// A failing consumer does not stop the ones after it. The pass reports a
    /// permanent error if any consumer produced one, else the first error.
    async fn deliver(
        &self,
        event_id: EventId,
        event: &(dyn Any + Send + Sync),
        consumers: &[Arc<dyn DynConsumer>],
        attempt: u32,
    ) -> Result<(), ConsumerError> {
        let mut failure: Option<ConsumerError> = None;
        for consumer in consumers {
            let name = consumer.name();
            match self
                .guard
                .apply_once(event_id, name, || consumer.handle_decoded(event))
                .await
            {
                Ok(Applied::Applied) => {
                    debug!(event_id = %event_id, consumer = name, attempt, "consumer applied event");
                }
                Ok(Applied::AlreadyApplied) => {}
                Err(err) => {
                    warn!(
                        event_id = %event_id,
                        consumer = name,
                        attempt,
                        error = %err,
                        "consumer failed"
                    );
                    let err = err.in_consumer(name);
                    failure = match failure {
                        Some(prev) if prev.is_retryable() && !err.is_retryable() => Some(err),
                        None => Some(err),
                        prev => prev,
                    };
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn persist(&self, record: &OutboxRecord, claim: DateTime<Utc>, report: &mut DispatchReport) {
        match self.store.save_outcome(record, claim).await {
            Ok(true) => match record.status {
                OutboxStatus::Completed => report.completed += 1,
                OutboxStatus::Failed => report.failed += 1,
                OutboxStatus::Pending => report.released += 1,
                OutboxStatus::Claimed => {}
            },
            Ok(false) => {
                debug!(event_id = %record.id, status = %record.status, "claim lost before outcome was saved");
                report.lost += 1;
            }
            Err(err) => {
                error!(
                    event_id = %record.id,
                    status = %record.status,
                    error = %err,
                    "failed to save outcome; record stays claimed until reclaimed"
                );
                report.lost += 1;
            }
        }
    }
}

impl<S> core::fmt::Debug for OutboxDispatcher<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OutboxDispatcher")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}
