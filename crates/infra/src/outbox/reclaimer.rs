//! Stale-claim reclaimer.

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use courier_core::EventId;

use super::store::{OutboxStore, OutboxStoreError};

/// `last_error` written on records the reclaimer fails.
pub const PROCESSING_TIMEOUT_ERROR: &str = "processing timeout exceeded";

/// Default age after which a claim is considered abandoned.
pub fn default_stale_after() -> Duration {
    Duration::minutes(30)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub reclaimed: Vec<EventId>,
}

/// Fails records whose dispatcher died (or hung) mid-processing.
///
/// Reclaimed records go to `Failed`, not back to `Pending`; a later outcome
/// write from the original dispatcher no longer matches its claim and is
/// dropped.
#[derive(Debug, Clone)]
pub struct StaleClaimReclaimer<S> {
    store: S,
    stale_after: Duration,
}

impl<S: OutboxStore> StaleClaimReclaimer<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            stale_after: default_stale_after(),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub async fn run_reclaim_sweep(&self) -> Result<ReclaimReport, OutboxStoreError> {
        let cutoff = Utc::now() - self.stale_after;
        let reclaimed = self
            .store
            .fail_stale_claims(cutoff, PROCESSING_TIMEOUT_ERROR)
            .await?;

        if reclaimed.is_empty() {
            debug!(cutoff = %cutoff, "no stale claims");
        } else {
            warn!(
                count = reclaimed.len(),
                cutoff = %cutoff,
                "failed outbox records with stale claims"
            );
        }
        Ok(ReclaimReport { reclaimed })
    }
}
