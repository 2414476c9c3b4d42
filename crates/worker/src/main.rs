use anyhow::Context;
use tokio_util::sync::CancellationToken;

use courier_worker::{WorkerSettings, connect, spawn_maintenance};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let settings = WorkerSettings::from_env()?;
    let store = connect(&settings).await?;
    tracing::info!(
        reclaim_every_secs = settings.outbox.reclaim_interval.as_secs(),
        stale_after_minutes = settings.outbox.stale_after.num_minutes(),
        "outbox schema ready"
    );

    let cancel = CancellationToken::new();
    let workers = spawn_maintenance(store, &settings, &cancel);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    cancel.cancel();
    for worker in workers {
        worker.shutdown().await;
    }
    Ok(())
}
