//! Static event registry: type tag → decoder + consumers.
//!
//! The registry is populated once at startup and then shared read-only by
//! dispatch cycles. Resolution is a map lookup on the persisted `event_type`
//! tag, so an unknown tag fails the same way on every attempt and can be
//! classified as permanent.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{ConsumerError, Event, EventConsumer, EventEnvelope};

/// A decoded `EventEnvelope<E>` with `E` erased.
pub type DecodedEvent = Box<dyn Any + Send + Sync>;

/// Why a stored event could not be turned back into a typed event.
///
/// Both variants are permanent: retrying the same bytes against the same
/// binary yields the same error.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    #[error("payload deserialization failed for '{event_type}': {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("consumer '{consumer}' is already subscribed to '{event_type}'")]
    DuplicateConsumer {
        event_type: &'static str,
        consumer: String,
    },

    #[error("event type '{event_type}' is claimed by more than one Rust type")]
    ConflictingEventType { event_type: &'static str },
}

type DecodeFn = fn(&EventEnvelope<String>) -> Result<DecodedEvent, DecodeError>;

/// Turns a raw envelope into a typed one for a single event type.
#[derive(Clone, Copy)]
pub struct Decoder {
    event_type: &'static str,
    decode: DecodeFn,
}

impl Decoder {
    pub fn event_type(&self) -> &'static str {
        self.event_type
    }

    pub fn decode(&self, raw: &EventEnvelope<String>) -> Result<DecodedEvent, DecodeError> {
        (self.decode)(raw)
    }
}

impl core::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Decoder")
            .field("event_type", &self.event_type)
            .finish()
    }
}

fn decode_as<E: Event>(raw: &EventEnvelope<String>) -> Result<DecodedEvent, DecodeError> {
    let event: E = serde_json::from_str(raw.payload()).map_err(|source| DecodeError::Payload {
        event_type: raw.event_type().to_string(),
        source,
    })?;
    Ok(Box::new(raw.with_payload(event)))
}

/// Object-safe view of an [`EventConsumer`], used by the dispatch loop.
#[async_trait]
pub trait DynConsumer: Send + Sync {
    fn name(&self) -> &str;

    /// `event` must be the output of the decoder registered for the same type.
    async fn handle_decoded(&self, event: &(dyn Any + Send + Sync)) -> Result<(), ConsumerError>;
}

struct TypedConsumer<E, C> {
    inner: C,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, C> DynConsumer for TypedConsumer<E, C>
where
    E: Event,
    C: EventConsumer<E>,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn handle_decoded(&self, event: &(dyn Any + Send + Sync)) -> Result<(), ConsumerError> {
        let envelope = event.downcast_ref::<EventEnvelope<E>>().ok_or_else(|| {
            ConsumerError::permanent(format!("expected a decoded '{}' event", E::EVENT_TYPE))
        })?;
        self.inner.handle(envelope).await
    }
}

struct Route {
    type_id: TypeId,
    decoder: Decoder,
    consumers: Vec<Arc<dyn DynConsumer>>,
}

/// Compile-time map from event type tag to decoder and consumers.
#[derive(Default)]
pub struct EventRegistry {
    routes: HashMap<&'static str, Route>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `E` decodable without subscribing anything to it.
    ///
    /// Records of a registered type with no consumers complete immediately.
    pub fn register<E: Event>(&mut self) -> Result<&mut Self, RegistryError> {
        self.route_mut::<E>()?;
        Ok(self)
    }

    /// Register `E` (if needed) and append `consumer` to its delivery list.
    ///
    /// Consumers run in subscription order.
    pub fn subscribe<E, C>(&mut self, consumer: C) -> Result<&mut Self, RegistryError>
    where
        E: Event,
        C: EventConsumer<E> + 'static,
    {
        let route = self.route_mut::<E>()?;
        if route.consumers.iter().any(|c| c.name() == consumer.name()) {
            return Err(RegistryError::DuplicateConsumer {
                event_type: E::EVENT_TYPE,
                consumer: consumer.name().to_string(),
            });
        }
        route.consumers.push(Arc::new(TypedConsumer {
            inner: consumer,
            _event: PhantomData,
        }));
        Ok(self)
    }

    fn route_mut<E: Event>(&mut self) -> Result<&mut Route, RegistryError> {
        let route = self.routes.entry(E::EVENT_TYPE).or_insert_with(|| Route {
            type_id: TypeId::of::<E>(),
            decoder: Decoder {
                event_type: E::EVENT_TYPE,
                decode: decode_as::<E>,
            },
            consumers: Vec::new(),
        });
        if route.type_id != TypeId::of::<E>() {
            return Err(RegistryError::ConflictingEventType {
                event_type: E::EVENT_TYPE,
            });
        }
        Ok(route)
    }

    /// Find the decoder for a persisted type tag.
    pub fn resolve(&self, event_type: &str) -> Result<Decoder, DecodeError> {
        self.routes
            .get(event_type)
            .map(|route| route.decoder)
            .ok_or_else(|| DecodeError::UnknownEventType(event_type.to_string()))
    }

    /// Consumers subscribed to a type tag, in delivery order.
    pub fn consumers_for(&self, event_type: &str) -> &[Arc<dyn DynConsumer>] {
        self.routes
            .get(event_type)
            .map(|route| route.consumers.as_slice())
            .unwrap_or(&[])
    }

    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }
}

impl core::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for (event_type, route) in &self.routes {
            let names: Vec<&str> = route.consumers.iter().map(|c| c.name()).collect();
            map.entry(event_type, &names);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use courier_core::EventId;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct InvoiceIssued {
        id: EventId,
        amount_cents: i64,
    }

    impl Event for InvoiceIssued {
        const EVENT_TYPE: &'static str = "billing.invoice.issued";

        fn event_id(&self) -> EventId {
            self.id
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Impostor {
        id: EventId,
    }

    impl Event for Impostor {
        const EVENT_TYPE: &'static str = "billing.invoice.issued";

        fn event_id(&self) -> EventId {
            self.id
        }
    }

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl EventConsumer<InvoiceIssued> for Arc<Recorder> {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, event: &EventEnvelope<InvoiceIssued>) -> Result<(), ConsumerError> {
            self.seen.lock().unwrap().push(event.payload().amount_cents);
            Ok(())
        }
    }

    fn raw(event_type: &str, payload: &str) -> EventEnvelope<String> {
        EventEnvelope::new(EventId::new(), event_type, Utc::now(), payload.to_string())
    }

    #[test]
    fn unknown_type_does_not_resolve() {
        let registry = EventRegistry::new();
        let err = registry.resolve("billing.invoice.voided").unwrap_err();
        assert!(matches!(err, DecodeError::UnknownEventType(t) if t == "billing.invoice.voided"));
        assert!(registry.consumers_for("billing.invoice.voided").is_empty());
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let mut registry = EventRegistry::new();
        registry.register::<InvoiceIssued>().unwrap();

        let decoder = registry.resolve(InvoiceIssued::EVENT_TYPE).unwrap();
        let err = decoder
            .decode(&raw(InvoiceIssued::EVENT_TYPE, r#"{"id": 42}"#))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Payload { .. }));
    }

    #[test]
    fn two_types_cannot_share_a_tag() {
        let mut registry = EventRegistry::new();
        registry.register::<InvoiceIssued>().unwrap();

        let err = registry.register::<Impostor>().unwrap_err();
        assert_eq!(
            err,
            RegistryError::ConflictingEventType {
                event_type: "billing.invoice.issued"
            }
        );
    }

    #[test]
    fn consumer_names_are_unique_per_type() {
        let mut registry = EventRegistry::new();
        let recorder = Arc::new(Recorder {
            name: "Ledger",
            ..Default::default()
        });
        registry
            .subscribe::<InvoiceIssued, _>(recorder.clone())
            .unwrap();

        let err = registry
            .subscribe::<InvoiceIssued, _>(recorder)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateConsumer { .. }));
    }

    #[tokio::test]
    async fn decoded_event_reaches_typed_consumer() {
        let mut registry = EventRegistry::new();
        let recorder = Arc::new(Recorder {
            name: "Ledger",
            ..Default::default()
        });
        registry
            .subscribe::<InvoiceIssued, _>(recorder.clone())
            .unwrap();

        let issued = InvoiceIssued {
            id: EventId::new(),
            amount_cents: 1250,
        };
        let payload = serde_json::to_string(&issued).unwrap();
        let decoded = registry
            .resolve(InvoiceIssued::EVENT_TYPE)
            .unwrap()
            .decode(&raw(InvoiceIssued::EVENT_TYPE, &payload))
            .unwrap();

        for consumer in registry.consumers_for(InvoiceIssued::EVENT_TYPE) {
            consumer.handle_decoded(decoded.as_ref()).await.unwrap();
        }

        assert_eq!(*recorder.seen.lock().unwrap(), vec![1250]);
    }
}
