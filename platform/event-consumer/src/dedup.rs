//! Inbound deduplication window
//!
//! A processed `event_id` is remembered until its `expires_at`. Expired
//! entries are dropped on the next lookup or by [`DedupStore::purge_expired`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use event_bus::{StoreError, StoreLifecycle};
use sqlx::PgPool;

/// Default dedup window: 7 days.
pub const DEFAULT_DEDUP_TTL_HOURS: i64 = 168;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRecord {
    pub event_id: String,
    pub event_type: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// True iff a non-expired record exists for `event_id`.
    async fn is_duplicate(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Idempotent upsert. A repeated mark never shortens the window.
    async fn mark_processed(
        &self,
        event_id: &str,
        event_type: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Drop every record expired at `now`; returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    fn lifecycle(&self) -> &StoreLifecycle;
}

/// Dedup store keyed by event id; per-key entry locking makes concurrent
/// marks for one id linearizable.
#[derive(Debug)]
pub struct InMemoryDedupStore {
    records: DashMap<String, DedupRecord>,
    lifecycle: StoreLifecycle,
}

impl Default for InMemoryDedupStore {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
            lifecycle: StoreLifecycle::new("dedup"),
        }
    }
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, event_id: &str) -> Option<DedupRecord> {
        self.records.get(event_id).map(|r| r.clone())
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn is_duplicate(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.lifecycle.ensure_readable()?;
        self.records.remove_if(event_id, |_, record| record.expires_at <= now);
        Ok(self.records.contains_key(event_id))
    }

    async fn mark_processed(
        &self,
        event_id: &str,
        event_type: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lifecycle.ensure_writable()?;
        self.records
            .entry(event_id.to_string())
            .and_modify(|record| {
                record.expires_at = record.expires_at.max(expires_at);
            })
            .or_insert_with(|| DedupRecord {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                expires_at,
            });
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.lifecycle.ensure_writable()?;
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at > now);
        Ok(before.saturating_sub(self.records.len()) as u64)
    }

    fn lifecycle(&self) -> &StoreLifecycle {
        &self.lifecycle
    }
}

/// Dedup store backed by `processed_events`.
#[derive(Debug)]
pub struct PgDedupStore {
    pool: PgPool,
    lifecycle: StoreLifecycle,
}

impl PgDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lifecycle: StoreLifecycle::new("dedup"),
        }
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn is_duplicate(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.lifecycle.ensure_readable()?;
        sqlx::query("DELETE FROM processed_events WHERE event_id = $1 AND expires_at <= $2")
            .bind(event_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn mark_processed(
        &self,
        event_id: &str,
        event_type: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lifecycle.ensure_writable()?;
        sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, event_type, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO UPDATE
            SET expires_at = GREATEST(processed_events.expires_at, EXCLUDED.expires_at)
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.lifecycle.ensure_writable()?;
        let result = sqlx::query("DELETE FROM processed_events WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    fn lifecycle(&self) -> &StoreLifecycle {
        &self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_mark_then_duplicate() {
        let store = InMemoryDedupStore::new();
        let now = Utc::now();
        assert!(!store.is_duplicate("e-1", now).await.unwrap());

        store.mark_processed("e-1", "thing.renamed", now + Duration::hours(168)).await.unwrap();
        assert!(store.is_duplicate("e-1", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_is_idempotent() {
        let store = InMemoryDedupStore::new();
        let now = Utc::now();
        let expiry = now + Duration::hours(1);
        store.mark_processed("e-1", "a.b", expiry).await.unwrap();
        store.mark_processed("e-1", "a.b", expiry).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("e-1").unwrap().expires_at, expiry);

        // A shorter window does not shrink the existing one
        store.mark_processed("e-1", "a.b", now).await.unwrap();
        assert_eq!(store.get("e-1").unwrap().expires_at, expiry);
    }

    #[tokio::test]
    async fn test_expired_record_dropped_lazily() {
        let store = InMemoryDedupStore::new();
        let now = Utc::now();
        store.mark_processed("e-1", "a.b", now + Duration::seconds(10)).await.unwrap();

        assert!(!store.is_duplicate("e-1", now + Duration::seconds(10)).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryDedupStore::new();
        let now = Utc::now();
        store.mark_processed("old", "a.b", now - Duration::seconds(1)).await.unwrap();
        store.mark_processed("new", "a.b", now + Duration::hours(1)).await.unwrap();

        assert_eq!(store.purge_expired(now).await.unwrap(), 1);
        assert!(store.get("new").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_marks_leave_one_record() {
        let store = Arc::new(InMemoryDedupStore::new());
        let expiry = Utc::now() + Duration::hours(1);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.mark_processed("e-1", "a.b", expiry).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.len(), 1);
        assert!(store.is_duplicate("e-1", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_store_rejects_reads() {
        let store = InMemoryDedupStore::new();
        store.lifecycle().close();
        assert!(store.is_duplicate("e-1", Utc::now()).await.is_err());
    }
}
