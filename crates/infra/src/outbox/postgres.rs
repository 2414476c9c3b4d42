//! Postgres-backed outbox store and consumer ledger.
//!
//! ## Claiming
//!
//! `claim_pending` is a single statement:
//!
//! ```sql
//! UPDATE outbox_records SET status = 'claimed', claimed_at = $now
//! WHERE id IN (SELECT id ... WHERE status = 'pending' ... FOR UPDATE SKIP LOCKED)
//!   AND status = 'pending'
//! RETURNING ...
//! ```
//!
//! `SKIP LOCKED` lets concurrent cycles partition the pending set instead of
//! queueing on each other's row locks; the outer `status = 'pending'` re-check
//! keeps the update a compare-and-swap under any isolation level.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxStoreError |
//! |------------|----------------------|------------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / RowNotFound / Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use courier_core::EventId;

use super::record::{OutboxRecord, OutboxStats, OutboxStatus};
use super::store::{ConsumerLedger, OutboxStore, OutboxStoreError, OutboxTransaction};

const SCHEMA: &str = include_str!("../../migrations/0001_outbox.sql");

const RECORD_COLUMNS: &str =
    "id, event_type, payload, occurred_at, status, claimed_at, retry_count, last_error";

/// Postgres outbox store.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), OutboxStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Open a business transaction. Capture into it, then `commit()`.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, OutboxStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))
    }
}

#[async_trait]
impl<'c> OutboxTransaction for Transaction<'c, Postgres> {
    async fn insert_records(&mut self, records: &[OutboxRecord]) -> Result<(), OutboxStoreError> {
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO outbox_records
                    (id, event_type, payload, occurred_at, status, claimed_at, retry_count, last_error)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(record.id.as_uuid())
            .bind(&record.event_type)
            .bind(&record.payload)
            .bind(record.occurred_at)
            .bind(record.status.as_str())
            .bind(record.claimed_at)
            .bind(record.retry_count as i32)
            .bind(record.last_error.as_deref())
            .execute(&mut **self)
            .await
            .map_err(|e| map_sqlx_error("insert_records", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self), err)]
    async fn claim_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        // Postgres keeps microseconds; the returned stamp is the claim token.
        let now = now.trunc_subsecs(6);
        let sql = format!(
            r#"
            UPDATE outbox_records
            SET status = 'claimed', claimed_at = $2
            WHERE id IN (
                SELECT id FROM outbox_records
                WHERE status = 'pending'
                ORDER BY occurred_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'pending'
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_pending", e))?;

        // RETURNING does not preserve the subquery order.
        let mut records = decode_rows(rows)?;
        records.sort_by(|a, b| (a.occurred_at, a.id).cmp(&(b.occurred_at, b.id)));
        Ok(records)
    }

    #[instrument(
        skip(self, record),
        fields(event_id = %record.id, status = %record.status),
        err
    )]
    async fn save_outcome(
        &self,
        record: &OutboxRecord,
        claim: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_records
            SET status = $2, claimed_at = $3, retry_count = $4, last_error = $5
            WHERE id = $1 AND status = 'claimed' AND claimed_at = $6
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.claimed_at)
        .bind(record.retry_count as i32)
        .bind(record.last_error.as_deref())
        .bind(claim)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_outcome", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn renew_claim(
        &self,
        id: EventId,
        claim: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_records
            SET claimed_at = $3
            WHERE id = $1 AND status = 'claimed' AND claimed_at = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(claim)
        .bind(now.trunc_subsecs(6))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_claim", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, reason), err)]
    async fn fail_stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<EventId>, OutboxStoreError> {
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            UPDATE outbox_records
            SET status = 'failed', last_error = $2
            WHERE status = 'claimed' AND claimed_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(reason)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_stale_claims", e))?;

        let mut ids: Vec<EventId> = ids.into_iter().map(EventId::from_uuid).collect();
        ids.sort();
        Ok(ids)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>, OutboxStoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM outbox_records WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM outbox_records
            WHERE status = $1
            ORDER BY occurred_at ASC, id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_status", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM outbox_records GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let status = status
                .parse::<OutboxStatus>()
                .map_err(|e| OutboxStoreError::Storage(e.to_string()))?;
            stats.add(status, count.max(0) as u64);
        }
        Ok(stats)
    }
}

#[async_trait]
impl ConsumerLedger for PostgresOutboxStore {
    #[instrument(skip(self), err)]
    async fn has_applied(
        &self,
        event_id: EventId,
        consumer: &str,
    ) -> Result<bool, OutboxStoreError> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM consumer_ledger WHERE event_id = $1 AND consumer_name = $2
            )
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(consumer)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_applied", e))
    }

    #[instrument(skip(self), err)]
    async fn record_applied(
        &self,
        event_id: EventId,
        consumer: &str,
    ) -> Result<(), OutboxStoreError> {
        sqlx::query(
            r#"
            INSERT INTO consumer_ledger (event_id, consumer_name, applied_at)
            VALUES ($1, $2, now())
            ON CONFLICT (event_id, consumer_name) DO NOTHING
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(consumer)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_applied", e))?;
        Ok(())
    }
}

/// Map a SQLx error to an `OutboxStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code.as_ref() == "23505" => OutboxStoreError::Duplicate(msg),
                _ => OutboxStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => OutboxStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
    rows.iter().map(decode_row).collect()
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<OutboxRecord, OutboxStoreError> {
    let row = OutboxRow::from_row(row).map_err(|e| {
        OutboxStoreError::Storage(format!("failed to deserialize outbox row: {}", e))
    })?;
    row.try_into()
}

// SQLx row types

#[derive(Debug)]
struct OutboxRow {
    id: uuid::Uuid,
    event_type: String,
    payload: String,
    occurred_at: DateTime<Utc>,
    status: String,
    claimed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    last_error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutboxRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            occurred_at: row.try_get("occurred_at")?,
            status: row.try_get("status")?,
            claimed_at: row.try_get("claimed_at")?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = OutboxStoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<OutboxStatus>()
            .map_err(|e| OutboxStoreError::Storage(e.to_string()))?;
        Ok(OutboxRecord {
            id: EventId::from_uuid(row.id),
            event_type: row.event_type,
            payload: row.payload,
            occurred_at: row.occurred_at,
            status,
            claimed_at: row.claimed_at,
            retry_count: row.retry_count.max(0) as u32,
            last_error: row.last_error,
        })
    }
}
