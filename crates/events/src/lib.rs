//! Domain events and their delivery contracts.
//!
//! - [`Event`]: a typed domain event with a stable type tag.
//! - [`PendingEvents`] / [`EventSource`]: how aggregates queue events until capture.
//! - [`EventEnvelope`]: an event plus the metadata stored next to it.
//! - [`EventConsumer`]: a named, idempotency-tracked reaction to one event type.
//! - [`EventRegistry`]: the static map from type tag to decoder and consumers.

pub mod consumer;
pub mod envelope;
pub mod event;
pub mod pending;
pub mod registry;

pub use consumer::{ConsumerError, EventConsumer};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use pending::{EventSource, PendingEvent, PendingEvents};
pub use registry::{DecodeError, DecodedEvent, Decoder, DynConsumer, EventRegistry, RegistryError};
