//! Background workers.

pub mod outbox_worker;
pub mod periodic;

pub use outbox_worker::OutboxWorker;
pub use periodic::{PeriodicTask, WorkerHandle};
