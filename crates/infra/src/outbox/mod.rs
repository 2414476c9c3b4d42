//! Transactional outbox.
//!
//! Events are captured into the outbox inside the business transaction,
//! delivered later by [`OutboxDispatcher`] with retries and an idempotency
//! ledger, and abandoned claims are failed by [`StaleClaimReclaimer`].

pub mod capture;
pub mod dispatcher;
pub mod idempotency;
pub mod in_memory;
pub mod postgres;
pub mod reclaimer;
pub mod record;
pub mod retry;
pub mod store;

pub use capture::{CaptureError, EventCapture, capture_events};
pub use dispatcher::{DEFAULT_BATCH_SIZE, DispatchError, DispatchReport, OutboxDispatcher};
pub use idempotency::{Applied, IdempotencyGuard};
pub use in_memory::{InMemoryOutboxStore, InMemoryTransaction};
pub use postgres::PostgresOutboxStore;
pub use reclaimer::{PROCESSING_TIMEOUT_ERROR, ReclaimReport, StaleClaimReclaimer};
pub use record::{OutboxRecord, OutboxStats, OutboxStatus, UnknownStatus};
pub use retry::{AttemptClass, BackoffStrategy, RetryOutcome, RetryPolicy, RetryableError};
pub use store::{ConsumerLedger, OutboxStore, OutboxStoreError, OutboxTransaction};
