use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::OutboxConfig;
use crate::outbox::{ConsumerLedger, OutboxDispatcher, OutboxStore, StaleClaimReclaimer};

use super::periodic::{PeriodicTask, WorkerHandle};

/// The two outbox schedules: dispatch (fast) and reclaim (slow).
///
/// They share nothing in memory; any number of these may run against one
/// store, in one process or many.
#[derive(Debug)]
pub struct OutboxWorker {
    dispatch: WorkerHandle,
    reclaim: WorkerHandle,
}

impl OutboxWorker {
    /// Spawn both schedules on the current runtime, using the intervals in
    /// `config`.
    pub fn spawn<S>(
        dispatcher: Arc<OutboxDispatcher<S>>,
        reclaimer: StaleClaimReclaimer<S>,
        config: &OutboxConfig,
        cancel: &CancellationToken,
    ) -> Self
    where
        S: OutboxStore + ConsumerLedger + Clone + 'static,
    {
        let dispatch = PeriodicTask::spawn(
            "outbox-dispatch",
            config.dispatch_interval,
            cancel,
            move |token| {
                let dispatcher = dispatcher.clone();
                async move {
                    if let Err(err) = dispatcher.run_dispatch_cycle(&token).await {
                        error!(error = %err, "dispatch cycle failed");
                    }
                }
            },
        );

        let reclaimer = Arc::new(reclaimer);
        let reclaim = PeriodicTask::spawn(
            "outbox-reclaim",
            config.reclaim_interval,
            cancel,
            move |_| {
                let reclaimer = reclaimer.clone();
                async move {
                    if let Err(err) = reclaimer.run_reclaim_sweep().await {
                        error!(error = %err, "reclaim sweep failed");
                    }
                }
            },
        );

        Self { dispatch, reclaim }
    }

    pub fn dispatch_ticks(&self) -> u64 {
        self.dispatch.ticks()
    }

    pub fn reclaim_ticks(&self) -> u64 {
        self.reclaim.ticks()
    }

    /// Stop both schedules and wait for in-flight ticks to wind down.
    pub async fn shutdown(self) {
        self.dispatch.shutdown().await;
        self.reclaim.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use courier_core::EventId;
    use courier_events::{Event, EventRegistry};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::outbox::{InMemoryOutboxStore, OutboxRecord, OutboxStatus};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Noted {
        id: EventId,
    }

    impl Event for Noted {
        const EVENT_TYPE: &'static str = "test.noted";

        fn event_id(&self) -> EventId {
            self.id
        }
    }

    #[tokio::test(start_paused = true)]
    async fn schedules_dispatch_and_reclaim() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let mut registry = EventRegistry::new();
        registry.register::<Noted>().unwrap();

        let config = OutboxConfig {
            dispatch_interval: Duration::from_secs(1),
            reclaim_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let worker = OutboxWorker::spawn(
            Arc::new(config.dispatcher(store.clone(), Arc::new(registry))),
            config.reclaimer(store.clone()),
            &config,
            &cancel,
        );

        let id = EventId::new();
        let payload = serde_json::to_string(&Noted { id }).unwrap();
        store
            .insert(OutboxRecord::pending(id, Noted::EVENT_TYPE, payload, Utc::now()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(worker.dispatch_ticks() >= 2);
        assert_eq!(worker.reclaim_ticks(), 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, OutboxStatus::Completed);

        cancel.cancel();
        worker.shutdown().await;
    }
}
