//! Outbox maintenance host.
//!
//! Dispatch needs the application's consumers, so applications run
//! [`OutboxWorker`](courier_infra::workers::OutboxWorker) themselves. This
//! process covers what needs no consumers: schema bootstrap, the stale-claim
//! sweep, and periodic status counts for operators.

use std::time::Duration;

use anyhow::{Context, bail};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use courier_infra::config::OutboxConfig;
use courier_infra::outbox::{OutboxStore, PostgresOutboxStore};
use courier_infra::workers::{PeriodicTask, WorkerHandle};

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const DB_MAX_CONNECTIONS: &str = "COURIER_DB_MAX_CONNECTIONS";
pub const STATS_INTERVAL_SECS: &str = "COURIER_STATS_INTERVAL_SECS";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub database_url: String,
    pub max_connections: u32,
    pub stats_interval: Duration,
    pub outbox: OutboxConfig,
}

impl WorkerSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup(DATABASE_URL)
            .filter(|url| !url.trim().is_empty())
            .with_context(|| format!("{DATABASE_URL} must be set"))?;

        let max_connections = match lookup(DB_MAX_CONNECTIONS) {
            None => 5,
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid {DB_MAX_CONNECTIONS}: '{raw}'"))?,
        };
        if max_connections == 0 {
            bail!("{DB_MAX_CONNECTIONS} must be greater than zero");
        }

        let stats_secs = match lookup(STATS_INTERVAL_SECS) {
            None => 60,
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid {STATS_INTERVAL_SECS}: '{raw}'"))?,
        };
        if stats_secs == 0 {
            bail!("{STATS_INTERVAL_SECS} must be greater than zero");
        }

        let outbox = OutboxConfig::from_lookup(&lookup).context("invalid outbox configuration")?;

        Ok(Self {
            database_url,
            max_connections,
            stats_interval: Duration::from_secs(stats_secs),
            outbox,
        })
    }
}

/// Connect the pool and make sure the outbox tables exist.
pub async fn connect(settings: &WorkerSettings) -> anyhow::Result<PostgresOutboxStore> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresOutboxStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to apply outbox schema")?;
    Ok(store)
}

/// Spawn the reclaim sweep and the stats log on the current runtime.
pub fn spawn_maintenance<S>(
    store: S,
    settings: &WorkerSettings,
    cancel: &CancellationToken,
) -> Vec<WorkerHandle>
where
    S: OutboxStore + Clone + 'static,
{
    let reclaimer = settings.outbox.reclaimer(store.clone());
    let reclaim = PeriodicTask::spawn(
        "outbox-reclaim",
        settings.outbox.reclaim_interval,
        cancel,
        move |_| {
            let reclaimer = reclaimer.clone();
            async move {
                match reclaimer.run_reclaim_sweep().await {
                    Ok(report) if !report.reclaimed.is_empty() => {
                        for id in &report.reclaimed {
                            warn!(event_id = %id, "outbox record failed after stale claim");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "reclaim sweep failed"),
                }
            }
        },
    );

    let stats = PeriodicTask::spawn("outbox-stats", settings.stats_interval, cancel, move |_| {
        let store = store.clone();
        async move {
            match store.stats().await {
                Ok(stats) => info!(
                    pending = stats.pending,
                    claimed = stats.claimed,
                    completed = stats.completed,
                    failed = stats.failed,
                    "outbox status"
                ),
                Err(err) => error!(error = %err, "failed to read outbox stats"),
            }
        }
    });

    vec![reclaim, stats]
}
