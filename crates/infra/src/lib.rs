//! Infrastructure layer: outbox persistence, dispatch, recovery, scheduling.

pub mod config;
pub mod outbox;
pub mod workers;
