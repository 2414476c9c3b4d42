//! Capture stage: aggregates' pending events → outbox rows, inside the
//! caller's transaction.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use tracing::debug;

use courier_core::EventId;
use courier_events::EventSource;

use super::record::OutboxRecord;
use super::store::{OutboxStoreError, OutboxTransaction};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to serialize event {event_id} ({event_type}): {source}")]
    Serialize {
        event_id: EventId,
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

/// Collects outbox records from the aggregates a business operation touched.
///
/// ```ignore
/// let mut tx = store.begin().await?;
/// repo.save(&mut tx, &order).await?;
/// let mut capture = EventCapture::new();
/// capture.collect(&mut order)?;
/// capture.write(&mut tx).await?;
/// tx.commit().await?;
/// ```
///
/// Capture times are truncated to microseconds and strictly increase within
/// one `EventCapture`, so raise order survives as `occurred_at` order.
#[derive(Debug, Default)]
pub struct EventCapture {
    records: Vec<OutboxRecord>,
    last_stamp: Option<DateTime<Utc>>,
}

impl EventCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize and drain `aggregate`'s queued events.
    ///
    /// All events are serialized before the queue is drained; on error the
    /// aggregate keeps its events and nothing is collected from it.
    pub fn collect<A: EventSource + ?Sized>(&mut self, aggregate: &mut A) -> Result<&mut Self, CaptureError> {
        let records = self.serialize(aggregate)?;
        aggregate.take_pending_events();
        self.records.extend(records);
        Ok(self)
    }

    /// Build records for `aggregate`'s queued events without draining them.
    fn serialize<A: EventSource + ?Sized>(
        &mut self,
        aggregate: &mut A,
    ) -> Result<Vec<OutboxRecord>, CaptureError> {
        let mut records = Vec::new();
        for event in aggregate.pending_events_mut().iter() {
            let payload = event.to_payload().map_err(|source| CaptureError::Serialize {
                event_id: event.event_id(),
                event_type: event.event_type(),
                source,
            })?;
            records.push(OutboxRecord::pending(
                event.event_id(),
                event.event_type(),
                payload,
                self.next_stamp(),
            ));
        }
        Ok(records)
    }

    pub fn records(&self) -> &[OutboxRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Stage every collected record into `tx`. Returns the number written.
    ///
    /// Nothing is visible to dispatchers until the caller commits `tx`. On
    /// success the capture is emptied; on error it keeps every record so the
    /// write can be retried on a fresh transaction.
    pub async fn write<T: OutboxTransaction + ?Sized>(&mut self, tx: &mut T) -> Result<usize, CaptureError> {
        if self.records.is_empty() {
            return Ok(0);
        }
        tx.insert_records(&self.records).await?;
        let written = self.records.len();
        self.records.clear();
        debug!(count = written, "captured outbox records");
        Ok(written)
    }

    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

/// Capture every pending event of `aggregates` into `tx` in one call.
///
/// All-or-nothing across the slice: every aggregate is serialized and the
/// rows are staged before any queue is drained, so on error every aggregate
/// still holds its events.
pub async fn capture_events<A, T>(tx: &mut T, aggregates: &mut [A]) -> Result<usize, CaptureError>
where
    A: EventSource,
    T: OutboxTransaction + ?Sized,
{
    let mut capture = EventCapture::new();
    for aggregate in aggregates.iter_mut() {
        let records = capture.serialize(aggregate)?;
        capture.records.extend(records);
    }
    let written = capture.write(tx).await?;
    for aggregate in aggregates.iter_mut() {
        aggregate.take_pending_events();
    }
    Ok(written)
}
