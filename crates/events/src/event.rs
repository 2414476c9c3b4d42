use serde::Serialize;
use serde::de::DeserializeOwned;

use courier_core::EventId;

/// A domain event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **identified** by an [`EventId`] assigned when raised
/// - **tagged** with a stable `EVENT_TYPE` that is persisted with the payload and
///   used to pick a decoder when the event is read back
///
/// Renaming `EVENT_TYPE` is a breaking change: rows written under the old tag
/// become undecodable and fail permanently on dispatch.
pub trait Event: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "sales.order.placed").
    const EVENT_TYPE: &'static str;

    /// Identifier assigned when the event was raised.
    fn event_id(&self) -> EventId;
}
