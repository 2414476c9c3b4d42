//! Per-aggregate queue of raised-but-not-yet-captured events.

use courier_core::{AggregateRoot, EventId};

use crate::Event;

trait ErasedEvent: core::fmt::Debug + Send + Sync {
    fn event_id(&self) -> EventId;
    fn event_type(&self) -> &'static str;
    fn to_payload(&self) -> Result<String, serde_json::Error>;
}

impl<E: Event> ErasedEvent for E {
    fn event_id(&self) -> EventId {
        Event::event_id(self)
    }

    fn event_type(&self) -> &'static str {
        E::EVENT_TYPE
    }

    fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A raised event of any type, waiting to be captured into the outbox.
#[derive(Debug)]
pub struct PendingEvent(Box<dyn ErasedEvent>);

impl PendingEvent {
    pub fn new<E: Event>(event: E) -> Self {
        Self(Box::new(event))
    }

    pub fn event_id(&self) -> EventId {
        self.0.event_id()
    }

    pub fn event_type(&self) -> &'static str {
        self.0.event_type()
    }

    /// Serialize the event body (JSON).
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        self.0.to_payload()
    }
}

/// Ordered queue of events an aggregate raised during the current operation.
///
/// Aggregates embed one of these and push to it from their command methods.
#[derive(Debug, Default)]
pub struct PendingEvents {
    queue: Vec<PendingEvent>,
}

impl PendingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise<E: Event>(&mut self, event: E) {
        self.queue.push(PendingEvent::new(event));
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingEvent> {
        self.queue.iter()
    }

    /// Remove and return every queued event, leaving the queue empty.
    pub fn take(&mut self) -> Vec<PendingEvent> {
        std::mem::take(&mut self.queue)
    }
}

/// An aggregate that raises domain events.
pub trait EventSource: AggregateRoot {
    fn pending_events_mut(&mut self) -> &mut PendingEvents;

    /// Drain the queue. Called by the capture stage; a drained event is never
    /// captured twice.
    fn take_pending_events(&mut self) -> Vec<PendingEvent> {
        self.pending_events_mut().take()
    }
}
