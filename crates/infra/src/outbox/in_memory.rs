//! In-memory outbox store (tests, benches, single-process embedding).

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::EventId;

use super::record::{OutboxRecord, OutboxStats, OutboxStatus};
use super::store::{ConsumerLedger, OutboxStore, OutboxStoreError, OutboxTransaction};

#[derive(Debug, Default)]
struct State {
    records: HashMap<EventId, OutboxRecord>,
    ledger: HashSet<(EventId, String)>,
}

/// Outbox table and consumer ledger behind one lock.
///
/// Every trait method holds the lock for its whole read-modify-write, which
/// gives the same single-statement atomicity the Postgres store gets from
/// conditional updates.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    state: RwLock<State>,
}

fn poisoned<T>(_: T) -> OutboxStoreError {
    OutboxStoreError::Storage("lock poisoned".to_string())
}

fn oldest_first(a: &OutboxRecord, b: &OutboxRecord) -> core::cmp::Ordering {
    (a.occurred_at, a.id).cmp(&(b.occurred_at, b.id))
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction for the capture stage.
    pub fn begin(&self) -> InMemoryTransaction<'_> {
        InMemoryTransaction {
            store: self,
            staged: Vec::new(),
        }
    }

    /// Write a record as-is, bypassing capture. Used to seed fixtures.
    pub fn insert(&self, record: OutboxRecord) -> Result<(), OutboxStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        if state.records.contains_key(&record.id) {
            return Err(OutboxStoreError::Duplicate(record.id.to_string()));
        }
        state.records.insert(record.id, record);
        Ok(())
    }

    pub fn len(&self) -> Result<usize, OutboxStoreError> {
        Ok(self.state.read().map_err(poisoned)?.records.len())
    }

    pub fn is_empty(&self) -> Result<bool, OutboxStoreError> {
        Ok(self.len()? == 0)
    }

    fn commit_staged(&self, staged: Vec<OutboxRecord>) -> Result<(), OutboxStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;

        // Validate everything before applying anything.
        let mut seen = HashSet::with_capacity(staged.len());
        for record in &staged {
            if state.records.contains_key(&record.id) || !seen.insert(record.id) {
                return Err(OutboxStoreError::Duplicate(record.id.to_string()));
            }
        }

        for record in staged {
            state.records.insert(record.id, record);
        }
        Ok(())
    }
}

/// Buffered writes against an [`InMemoryOutboxStore`].
///
/// Staged rows are applied all-or-nothing on [`commit`](Self::commit) and
/// discarded on [`rollback`](Self::rollback) or drop.
#[derive(Debug)]
pub struct InMemoryTransaction<'a> {
    store: &'a InMemoryOutboxStore,
    staged: Vec<OutboxRecord>,
}

impl InMemoryTransaction<'_> {
    pub fn commit(self) -> Result<(), OutboxStoreError> {
        self.store.commit_staged(self.staged)
    }

    pub fn rollback(self) {}

    pub fn staged(&self) -> &[OutboxRecord] {
        &self.staged
    }
}

#[async_trait]
impl OutboxTransaction for InMemoryTransaction<'_> {
    async fn insert_records(&mut self, records: &[OutboxRecord]) -> Result<(), OutboxStoreError> {
        let state = self.store.state.read().map_err(poisoned)?;
        let mut seen = HashSet::with_capacity(records.len());
        for record in records {
            let staged_twice =
                !seen.insert(record.id) || self.staged.iter().any(|r| r.id == record.id);
            if staged_twice || state.records.contains_key(&record.id) {
                return Err(OutboxStoreError::Duplicate(record.id.to_string()));
            }
        }
        self.staged.extend_from_slice(records);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;

        let mut candidates: Vec<&OutboxRecord> = state
            .records
            .values()
            .filter(|r| r.status == OutboxStatus::Pending)
            .collect();
        candidates.sort_by(|a, b| oldest_first(a, b));
        let ids: Vec<EventId> = candidates.into_iter().take(limit).map(|r| r.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = state.records.get_mut(&id) {
                record.mark_claimed(now);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn save_outcome(
        &self,
        record: &OutboxRecord,
        claim: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let stored = state
            .records
            .get_mut(&record.id)
            .ok_or(OutboxStoreError::NotFound(record.id))?;

        if stored.status != OutboxStatus::Claimed || stored.claimed_at != Some(claim) {
            return Ok(false);
        }

        stored.status = record.status;
        stored.claimed_at = record.claimed_at;
        stored.retry_count = record.retry_count;
        stored.last_error = record.last_error.clone();
        Ok(true)
    }

    async fn renew_claim(
        &self,
        id: EventId,
        claim: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        match state.records.get_mut(&id) {
            Some(stored)
                if stored.status == OutboxStatus::Claimed && stored.claimed_at == Some(claim) =>
            {
                stored.claimed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<EventId>, OutboxStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let mut reclaimed = Vec::new();
        for record in state.records.values_mut() {
            let stale = record.status == OutboxStatus::Claimed
                && record.claimed_at.is_some_and(|at| at < cutoff);
            if stale {
                record.fail(reason);
                reclaimed.push(record.id);
            }
        }
        reclaimed.sort();
        Ok(reclaimed)
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>, OutboxStoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.records.get(&id).cloned())
    }

    async fn list_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut records: Vec<OutboxRecord> = state
            .records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        records.sort_by(oldest_first);
        records.truncate(limit);
        Ok(records)
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut stats = OutboxStats::default();
        for record in state.records.values() {
            stats.add(record.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl ConsumerLedger for InMemoryOutboxStore {
    async fn has_applied(
        &self,
        event_id: EventId,
        consumer: &str,
    ) -> Result<bool, OutboxStoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.ledger.contains(&(event_id, consumer.to_string())))
    }

    async fn record_applied(
        &self,
        event_id: EventId,
        consumer: &str,
    ) -> Result<(), OutboxStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        state.ledger.insert((event_id, consumer.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record_at(offset_secs: i64) -> OutboxRecord {
        let base = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        OutboxRecord::pending(
            EventId::new(),
            "test.happened",
            "{}",
            base + Duration::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn claim_takes_oldest_pending_first() {
        let store = InMemoryOutboxStore::new();
        let late = record_at(30);
        let early = record_at(10);
        let middle = record_at(20);
        for r in [&late, &early, &middle] {
            store.insert(r.clone()).unwrap();
        }

        let now = Utc::now();
        let claimed = store.claim_pending(2, now).await.unwrap();
        let ids: Vec<EventId> = claimed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, middle.id]);
        assert!(claimed.iter().all(|r| r.status == OutboxStatus::Claimed));
        assert!(claimed.iter().all(|r| r.claimed_at == Some(now)));

        let rest = store.claim_pending(10, now).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, late.id);
        assert!(store.claim_pending(10, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outcome_requires_the_current_claim() {
        let store = InMemoryOutboxStore::new();
        let record = record_at(0);
        store.insert(record.clone()).unwrap();

        let first = Utc::now();
        let mut claimed = store.claim_pending(1, first).await.unwrap().remove(0);

        // Reclaimed to Failed behind the dispatcher's back.
        store
            .fail_stale_claims(first + Duration::seconds(1), "processing timeout exceeded")
            .await
            .unwrap();

        claimed.complete();
        assert!(!store.save_outcome(&claimed, first).await.unwrap());

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("processing timeout exceeded"));
    }

    #[tokio::test]
    async fn renewal_moves_the_claim_stamp() {
        let store = InMemoryOutboxStore::new();
        let record = record_at(0);
        store.insert(record.clone()).unwrap();

        let first = Utc::now();
        store.claim_pending(1, first).await.unwrap();
        let second = first + Duration::seconds(5);
        assert!(store.renew_claim(record.id, first, second).await.unwrap());

        // The old stamp no longer matches.
        assert!(!store.renew_claim(record.id, first, second).await.unwrap());
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.claimed_at, Some(second));
    }

    #[tokio::test]
    async fn renewal_fails_once_reclaimed() {
        let store = InMemoryOutboxStore::new();
        let record = record_at(0);
        store.insert(record.clone()).unwrap();

        let first = Utc::now();
        store.claim_pending(1, first).await.unwrap();
        store
            .fail_stale_claims(first + Duration::seconds(1), "processing timeout exceeded")
            .await
            .unwrap();

        assert!(!store.renew_claim(record.id, first, Utc::now()).await.unwrap());
        assert!(!store.renew_claim(EventId::new(), first, Utc::now()).await.unwrap());
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
    }

    #[test]
    fn poisoned_lock_is_a_storage_error() {
        let store = InMemoryOutboxStore::new();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = store.state.write().unwrap();
            panic!("poison the lock");
        }));

        let poisoned = OutboxStoreError::Storage("lock poisoned".to_string());
        assert_eq!(store.len().unwrap_err(), poisoned);
        assert_eq!(store.is_empty().unwrap_err(), poisoned);
    }

    #[tokio::test]
    async fn committed_transaction_applies_all_rows() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin();
        tx.insert_records(&[record_at(0), record_at(1)]).await.unwrap();
        assert!(store.is_empty().unwrap());

        tx.commit().unwrap();
        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(store.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_nothing() {
        let store = InMemoryOutboxStore::new();
        {
            let mut tx = store.begin();
            tx.insert_records(&[record_at(0)]).await.unwrap();
        }
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = InMemoryOutboxStore::new();
        let record = record_at(0);
        store.insert(record.clone()).unwrap();

        let mut tx = store.begin();
        let err = tx.insert_records(&[record.clone()]).await.unwrap_err();
        assert_eq!(err, OutboxStoreError::Duplicate(record.id.to_string()));
    }

    #[tokio::test]
    async fn ledger_insert_is_idempotent() {
        let store = InMemoryOutboxStore::new();
        let id = EventId::new();
        assert!(!store.has_applied(id, "HandlerA").await.unwrap());

        store.record_applied(id, "HandlerA").await.unwrap();
        store.record_applied(id, "HandlerA").await.unwrap();
        assert!(store.has_applied(id, "HandlerA").await.unwrap());
        assert!(!store.has_applied(id, "HandlerB").await.unwrap());
    }

    #[tokio::test]
    async fn list_by_status_is_oldest_first_and_bounded() {
        let store = InMemoryOutboxStore::new();
        let a = record_at(5);
        let b = record_at(1);
        let c = record_at(3);
        for r in [&a, &b, &c] {
            store.insert(r.clone()).unwrap();
        }

        let listed = store.list_by_status(OutboxStatus::Pending, 2).await.unwrap();
        let ids: Vec<EventId> = listed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b.id, c.id]);
        assert!(store
            .list_by_status(OutboxStatus::Completed, 10)
            .await
            .unwrap()
            .is_empty());
    }
}
