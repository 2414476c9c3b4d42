//! Outbox persistence contracts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::EventId;

use super::record::{OutboxRecord, OutboxStats, OutboxStatus};

/// Outbox store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox record not found: {0}")]
    NotFound(EventId),
    #[error("outbox record already exists: {0}")]
    Duplicate(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable outbox table.
///
/// Every state-changing method is a single conditional write, so dispatch
/// cycles and reclaim sweeps on any number of processes coordinate through
/// the store alone.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically move up to `limit` `Pending` records to `Claimed`, stamping
    /// `claimed_at = now`. Returned in `occurred_at` ascending order.
    ///
    /// A record is returned by at most one concurrent caller.
    async fn claim_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError>;

    /// Persist `status`, `claimed_at`, `retry_count` and `last_error` of a
    /// record this caller claimed with stamp `claim`.
    ///
    /// Returns `false` when the record no longer carries that claim (it was
    /// reclaimed meanwhile); nothing is written in that case.
    async fn save_outcome(
        &self,
        record: &OutboxRecord,
        claim: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError>;

    /// Re-stamp a record this caller still holds: only when it is `Claimed`
    /// with `claimed_at == claim` is `claimed_at` set to `now`.
    ///
    /// Returns `false` when the claim was lost (reclaimed or completed
    /// elsewhere); the caller must then leave the record alone.
    async fn renew_claim(
        &self,
        id: EventId,
        claim: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError>;

    /// Move every `Claimed` record with `claimed_at < cutoff` to `Failed`
    /// with `last_error = reason`. Returns the affected ids.
    async fn fail_stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<EventId>, OutboxStoreError>;

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>, OutboxStoreError>;

    /// Records in one status, oldest first.
    async fn list_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError>;
}

/// Per-(event, consumer) record of completed applications.
#[async_trait]
pub trait ConsumerLedger: Send + Sync {
    async fn has_applied(&self, event_id: EventId, consumer: &str)
    -> Result<bool, OutboxStoreError>;

    /// Insert-if-absent; recording the same pair twice is not an error.
    async fn record_applied(&self, event_id: EventId, consumer: &str)
    -> Result<(), OutboxStoreError>;
}

/// An open business transaction the capture stage can write outbox rows into.
///
/// Rows become visible only when the caller commits its transaction.
#[async_trait]
pub trait OutboxTransaction: Send {
    /// Stage new `Pending` records. A duplicate id fails with
    /// [`OutboxStoreError::Duplicate`], which must abort the whole transaction.
    async fn insert_records(&mut self, records: &[OutboxRecord]) -> Result<(), OutboxStoreError>;
}

#[async_trait]
impl<T: OutboxStore + ?Sized> OutboxStore for Arc<T> {
    async fn claim_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        (**self).claim_pending(limit, now).await
    }

    async fn save_outcome(
        &self,
        record: &OutboxRecord,
        claim: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        (**self).save_outcome(record, claim).await
    }

    async fn renew_claim(
        &self,
        id: EventId,
        claim: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        (**self).renew_claim(id, claim, now).await
    }

    async fn fail_stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<EventId>, OutboxStoreError> {
        (**self).fail_stale_claims(cutoff, reason).await
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>, OutboxStoreError> {
        (**self).get(id).await
    }

    async fn list_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        (**self).list_by_status(status, limit).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats().await
    }
}

#[async_trait]
impl<T: ConsumerLedger + ?Sized> ConsumerLedger for Arc<T> {
    async fn has_applied(
        &self,
        event_id: EventId,
        consumer: &str,
    ) -> Result<bool, OutboxStoreError> {
        (**self).has_applied(event_id, consumer).await
    }

    async fn record_applied(
        &self,
        event_id: EventId,
        consumer: &str,
    ) -> Result<(), OutboxStoreError> {
        (**self).record_applied(event_id, consumer).await
    }
}
