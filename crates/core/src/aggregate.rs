//! Aggregate root trait.

/// Aggregate root marker + minimal interface.
///
/// Aggregates are the unit a business transaction mutates. They queue the
/// domain events they raise; the outbox capture stage drains that queue inside
/// the same commit as the aggregate's own write.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug + core::fmt::Display;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    fn version(&self) -> u64;
}
