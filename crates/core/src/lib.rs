//! `courier-core` — identifiers and aggregate primitives shared by every layer.
//!
//! This crate is pure: no IO, no async, no serialization formats beyond serde derives.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::AggregateRoot;
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, EventId};
