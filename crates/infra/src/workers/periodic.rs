use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Handle to stop and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Completed ticks so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Token the worker observes; cancelled by [`shutdown`](Self::shutdown).
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A tick in progress runs to its next cancellation check.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(worker = self.name, error = %err, "worker task ended abnormally");
            }
        }
    }
}

/// Runs an async tick on a fixed interval until cancelled.
///
/// The first tick fires immediately. A tick that overruns the interval delays
/// the next one instead of triggering a burst of catch-up ticks.
#[derive(Debug)]
pub struct PeriodicTask;

impl PeriodicTask {
    /// Spawn on the current Tokio runtime.
    ///
    /// The worker stops when `parent` or the returned handle is cancelled.
    /// `tick` receives the worker's own token so long ticks can stop early.
    pub fn spawn<F, Fut>(
        name: &'static str,
        every: Duration,
        parent: &CancellationToken,
        mut tick: F,
    ) -> WorkerHandle
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = parent.child_token();
        let ticks = Arc::new(AtomicU64::new(0));

        let token = cancel.clone();
        let counter = ticks.clone();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(worker = name, every_ms = every.as_millis() as u64, "worker started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tick(token.clone()).await;
                counter.fetch_add(1, Ordering::Relaxed);
            }

            info!(worker = name, "worker stopped");
        });

        WorkerHandle {
            name,
            cancel,
            join: Some(join),
            ticks,
        }
    }
}
