use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{StoreError, StoreLifecycle};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::{DlqQuery, DlqRecord, DlqStore};

/// DLQ backed by the `failed_events` table.
#[derive(Debug)]
pub struct PgDlqStore {
    pool: PgPool,
    lifecycle: StoreLifecycle,
}

#[derive(Debug, FromRow)]
struct FailedEventRow {
    id: Uuid,
    source_topic: String,
    consumer_group: Option<String>,
    error_type: Option<String>,
    error_summary: String,
    retry_count: i32,
    event_id: Option<String>,
    original_event: Vec<u8>,
    created_at: DateTime<Utc>,
    replayed_at: Option<DateTime<Utc>>,
}

impl From<FailedEventRow> for DlqRecord {
    fn from(row: FailedEventRow) -> Self {
        DlqRecord {
            id: row.id,
            source_topic: row.source_topic,
            consumer_group: row.consumer_group,
            error_type: row.error_type,
            error_summary: row.error_summary,
            retry_count: row.retry_count,
            event_id: row.event_id,
            original_event: row.original_event,
            created_at: row.created_at,
            replayed_at: row.replayed_at,
        }
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl PgDlqStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lifecycle: StoreLifecycle::new("dlq"),
        }
    }
}

#[async_trait]
impl DlqStore for PgDlqStore {
    async fn create(&self, record: DlqRecord) -> Result<(), StoreError> {
        self.lifecycle.ensure_writable()?;
        sqlx::query(
            r#"
            INSERT INTO failed_events
                (id, source_topic, consumer_group, error_type, error_summary,
                 retry_count, event_id, original_event, created_at, replayed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(&record.source_topic)
        .bind(&record.consumer_group)
        .bind(&record.error_type)
        .bind(&record.error_summary)
        .bind(record.retry_count)
        .bind(&record.event_id)
        .bind(&record.original_event)
        .bind(record.created_at)
        .bind(record.replayed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        tracing::error!(
            dlq_id = %record.id,
            event_id = ?record.event_id,
            source_topic = %record.source_topic,
            error_type = ?record.error_type,
            retry_count = record.retry_count,
            error = %record.error_summary,
            "event moved to DLQ"
        );
        Ok(())
    }

    async fn query(&self, query: &DlqQuery) -> Result<Vec<DlqRecord>, StoreError> {
        self.lifecycle.ensure_readable()?;
        let rows = sqlx::query_as::<_, FailedEventRow>(
            r#"
            SELECT id, source_topic, consumer_group, error_type, error_summary,
                   retry_count, event_id, original_event, created_at, replayed_at
            FROM failed_events
            WHERE ($1::TEXT IS NULL OR source_topic = $1)
              AND ($2::TEXT IS NULL OR consumer_group = $2)
              AND ($3::TEXT IS NULL OR error_type = $3)
              AND ($4 OR replayed_at IS NULL)
            ORDER BY created_at DESC, seq DESC
            LIMIT $5
            "#,
        )
        .bind(&query.source_topic)
        .bind(&query.consumer_group)
        .bind(&query.error_type)
        .bind(query.include_replayed)
        .bind(query.effective_limit() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(DlqRecord::from).collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DlqRecord>, StoreError> {
        self.lifecycle.ensure_readable()?;
        let row = sqlx::query_as::<_, FailedEventRow>(
            r#"
            SELECT id, source_topic, consumer_group, error_type, error_summary,
                   retry_count, event_id, original_event, created_at, replayed_at
            FROM failed_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(DlqRecord::from))
    }

    async fn mark_replayed(
        &self,
        ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        self.lifecycle.ensure_writable()?;
        let marked = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE failed_events
            SET replayed_at = $2
            WHERE id = ANY($1) AND replayed_at IS NULL
            RETURNING id
            "#,
        )
        .bind(ids)
        .bind(at)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(marked)
    }

    fn lifecycle(&self) -> &StoreLifecycle {
        &self.lifecycle
    }
}
