use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{codec, EventClass, EventEnvelope, StoreError, StoreLifecycle};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{Outbox, OutboxRecord};

/// Outbox stored in `events_outbox`. Enqueue happens inside the caller's
/// transaction; the relay side uses the pool.
#[derive(Debug)]
pub struct PgOutbox {
    pool: PgPool,
    lifecycle: StoreLifecycle,
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    record_id: Uuid,
    event_class: String,
    envelope: Vec<u8>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    attempts: i32,
    last_error: Option<String>,
    dead_lettered_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let envelope = codec::decode(&row.envelope)
            .map_err(|e| {
                StoreError::Serialization(format!("outbox record {}: {e}", row.record_id))
            })?;
        let event_class = row
            .event_class
            .parse::<EventClass>()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(OutboxRecord {
            record_id: row.record_id,
            event_class,
            envelope,
            created_at: row.created_at,
            sent_at: row.sent_at,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            dead_lettered_at: row.dead_lettered_at,
        })
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl PgOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lifecycle: StoreLifecycle::new("outbox"),
        }
    }

    /// Append an envelope within the transaction that performs the business write.
    pub async fn enqueue(
        tx: &mut Transaction<'_, Postgres>,
        envelope: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let record_id = Uuid::new_v4();
        let bytes = codec::encode(envelope).map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO events_outbox
                (record_id, event_id, event_class, partition_key, envelope, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record_id)
        .bind(envelope.event_id())
        .bind(envelope.effective_class().as_str())
        .bind(envelope.partition_key())
        .bind(bytes)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        tracing::debug!(
            record_id = %record_id,
            event_id = %envelope.event_id(),
            event_type = %envelope.event_type(),
            "event enqueued to outbox"
        );
        Ok(record_id)
    }
}

#[async_trait]
impl Outbox for PgOutbox {
    async fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        self.lifecycle.ensure_readable()?;
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT record_id, event_class, envelope, created_at, sent_at,
                   attempts, last_error, dead_lettered_at
            FROM events_outbox
            WHERE sent_at IS NULL AND dead_lettered_at IS NULL
            ORDER BY seq ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(OutboxRecord::try_from).collect()
    }

    async fn mark_sent(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.lifecycle.ensure_readable()?;
        sqlx::query("UPDATE events_outbox SET sent_at = COALESCE(sent_at, $2) WHERE record_id = $1")
            .bind(record_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn record_failure(&self, record_id: Uuid, error: &str) -> Result<u32, StoreError> {
        self.lifecycle.ensure_readable()?;
        let attempts = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE events_outbox
            SET attempts = attempts + 1, last_error = $2
            WHERE record_id = $1
            RETURNING attempts
            "#,
        )
        .bind(record_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("outbox record {record_id}")))?;

        Ok(attempts.max(0) as u32)
    }

    async fn park(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.lifecycle.ensure_readable()?;
        sqlx::query(
            r#"
            UPDATE events_outbox
            SET dead_lettered_at = COALESCE(dead_lettered_at, $2)
            WHERE record_id = $1
            "#,
        )
        .bind(record_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_sent_by_event_id(
        &self,
        event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.lifecycle.ensure_readable()?;
        let result = sqlx::query(
            "UPDATE events_outbox SET sent_at = $2 WHERE event_id = $1 AND sent_at IS NULL",
        )
        .bind(event_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_sent(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.lifecycle.ensure_readable()?;
        let result =
            sqlx::query("DELETE FROM events_outbox WHERE sent_at IS NOT NULL AND sent_at < $1")
                .bind(before)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    fn lifecycle(&self) -> &StoreLifecycle {
        &self.lifecycle
    }
}
