//! Outbox record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::EventId;
use courier_events::EventEnvelope;

/// Processing state of an outbox record.
///
/// ```text
/// Pending ──claim──▶ Claimed ──▶ Completed   (terminal)
///    ▲                  │
///    └────release───────┤
///                       └──────▶ Failed      (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be claimed by a dispatch cycle
    Pending,
    /// Held by exactly one dispatch cycle
    Claimed,
    /// Every consumer applied the event
    Completed,
    /// Unresolvable, undecodable, out of retries, or abandoned past the stale threshold
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown outbox status '{0}'")]
pub struct UnknownStatus(pub String);

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Claimed => "claimed",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Completed | OutboxStatus::Failed)
    }
}

impl core::str::FromStr for OutboxStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "claimed" => Ok(OutboxStatus::Claimed),
            "completed" => Ok(OutboxStatus::Completed),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl core::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable unit of work: one row per raised domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// The domain event's own id (also the idempotency key)
    pub id: EventId,
    /// Type tag used to pick a decoder
    pub event_type: String,
    /// Serialized event body (JSON)
    pub payload: String,
    /// Capture time; dispatch order is ascending on this column
    pub occurred_at: DateTime<Utc>,
    pub status: OutboxStatus,
    /// Stamp written by the last claim. Outcome writes are conditional on it.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Delivery attempts so far
    pub retry_count: u32,
    /// Last failure, cleared on completion
    pub last_error: Option<String>,
}

impl OutboxRecord {
    /// A freshly captured record.
    pub fn pending(
        id: EventId,
        event_type: impl Into<String>,
        payload: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            payload: payload.into(),
            occurred_at,
            status: OutboxStatus::Pending,
            claimed_at: None,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Raw envelope (payload still serialized) for decoder input.
    pub fn to_envelope(&self) -> EventEnvelope<String> {
        EventEnvelope::new(
            self.id,
            self.event_type.clone(),
            self.occurred_at,
            self.payload.clone(),
        )
    }

    pub fn mark_claimed(&mut self, at: DateTime<Utc>) {
        self.status = OutboxStatus::Claimed;
        self.claimed_at = Some(at);
    }

    /// All consumers succeeded. The claim stamp is kept as the processing time.
    pub fn complete(&mut self) {
        self.status = OutboxStatus::Completed;
        self.last_error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = OutboxStatus::Failed;
        self.last_error = Some(error.into());
    }

    /// Hand the record back to the pending pool for a later cycle.
    pub fn release(&mut self, error: Option<String>) {
        self.status = OutboxStatus::Pending;
        self.claimed_at = None;
        if error.is_some() {
            self.last_error = error;
        }
    }
}

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl OutboxStats {
    pub fn add(&mut self, status: OutboxStatus, count: u64) {
        match status {
            OutboxStatus::Pending => self.pending += count,
            OutboxStatus::Claimed => self.claimed += count,
            OutboxStatus::Completed => self.completed += count,
            OutboxStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> OutboxRecord {
        OutboxRecord::pending(EventId::new(), "test.happened", "{}", Utc::now())
    }

    #[test]
    fn status_round_trips_through_its_column_value() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Claimed,
            OutboxStatus::Completed,
            OutboxStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("processing".parse::<OutboxStatus>().is_err());
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(!OutboxStatus::Pending.is_terminal());
        assert!(!OutboxStatus::Claimed.is_terminal());
        assert!(OutboxStatus::Completed.is_terminal());
        assert!(OutboxStatus::Failed.is_terminal());
    }

    #[test]
    fn completion_clears_last_error() {
        let mut r = record();
        r.mark_claimed(Utc::now());
        r.last_error = Some("earlier failure".to_string());

        r.complete();
        assert_eq!(r.status, OutboxStatus::Completed);
        assert!(r.last_error.is_none());
        assert!(r.claimed_at.is_some());
    }

    #[test]
    fn release_drops_the_claim_but_keeps_history() {
        let mut r = record();
        r.mark_claimed(Utc::now());
        r.retry_count = 2;

        r.release(Some("shutdown during backoff".to_string()));
        assert_eq!(r.status, OutboxStatus::Pending);
        assert!(r.claimed_at.is_none());
        assert_eq!(r.retry_count, 2);
        assert_eq!(r.last_error.as_deref(), Some("shutdown during backoff"));
    }

    #[test]
    fn stats_accumulate_per_status() {
        let mut stats = OutboxStats::default();
        stats.add(OutboxStatus::Pending, 3);
        stats.add(OutboxStatus::Failed, 1);
        stats.add(OutboxStatus::Pending, 2);

        assert_eq!(stats.pending, 5);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 6);
    }
}
