use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::EventId;

/// An event body plus the metadata the outbox stores next to it.
///
/// Dispatch works with two shapes:
/// - `EventEnvelope<String>`: the raw row, payload still serialized
/// - `EventEnvelope<E>`: the decoded event handed to consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    event_type: String,

    /// When the event was captured (business time, FIFO key).
    occurred_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: EventId,
        event_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Replace the payload, keeping the metadata.
    pub fn with_payload<T>(&self, payload: T) -> EventEnvelope<T> {
        EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            occurred_at: self.occurred_at,
            payload,
        }
    }
}
