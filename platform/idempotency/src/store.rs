//! Idempotency key storage
//!
//! A key is first *reserved* with the hash of the request it guards, then
//! *completed* with the response to replay. A reservation that is never
//! completed is released, or lapses when its lease expires.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use event_bus::{expires_at, StoreError, StoreLifecycle};
use sqlx::{FromRow, PgPool};

/// Completed responses are replayable for 7 days by default.
pub const DEFAULT_IDEMPOTENCY_TTL_HOURS: i64 = 168;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    /// Hex SHA-256 of the canonical request
    pub request_hash: String,
    pub response_code: Option<u16>,
    pub response_body: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_completed(&self) -> bool {
        self.response_code.is_some()
    }

    fn reservation(
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            response_code: None,
            response_body: None,
            created_at: now,
            expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The caller owns the key and must complete or release it
    Reserved,
    /// Same request seen before; completed or still in flight
    AlreadyReserved(IdempotencyRecord),
    /// Key reused with a different request
    Conflict(IdempotencyRecord),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Live record for `key`; expired records read as absent.
    async fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Reserve `key` for `request_hash` until `expires_at`. At most one
    /// concurrent caller gets [`ReserveOutcome::Reserved`].
    async fn reserve(
        &self,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError>;

    /// Store the response and extend the record to at least `now + ttl()`.
    /// Fails with `NotFound` when no reservation exists.
    async fn complete(
        &self,
        key: &str,
        response_code: u16,
        response_body: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Drop an uncompleted reservation. Completed records are kept.
    async fn release(&self, key: &str) -> Result<(), StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    fn ttl(&self) -> Duration;

    fn lifecycle(&self) -> &StoreLifecycle;
}

#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
    ttl: Duration,
    lifecycle: StoreLifecycle,
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
            ttl: Duration::hours(DEFAULT_IDEMPOTENCY_TTL_HOURS),
            lifecycle: StoreLifecycle::new("idempotency"),
        }
    }
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.lifecycle.ensure_readable()?;
        self.records.remove_if(key, |_, r| r.expires_at <= now);
        Ok(self.records.get(key).map(|r| r.clone()))
    }

    async fn reserve(
        &self,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError> {
        self.lifecycle.ensure_writable()?;
        let fresh = IdempotencyRecord::reservation(key, request_hash, now, expires_at);

        let outcome = match self.records.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                ReserveOutcome::Reserved
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.expires_at <= now {
                    slot.insert(fresh);
                    ReserveOutcome::Reserved
                } else if existing.request_hash == request_hash {
                    ReserveOutcome::AlreadyReserved(existing.clone())
                } else {
                    ReserveOutcome::Conflict(existing.clone())
                }
            }
        };
        Ok(outcome)
    }

    async fn complete(
        &self,
        key: &str,
        response_code: u16,
        response_body: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lifecycle.ensure_readable()?;
        let mut record = self
            .records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("idempotency key {key}")))?;

        record.response_code = Some(response_code);
        record.response_body = Some(response_body);
        record.expires_at = record.expires_at.max(expires_at(now, self.ttl));
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.lifecycle.ensure_readable()?;
        self.records.remove_if(key, |_, r| !r.is_completed());
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.lifecycle.ensure_readable()?;
        let before = self.records.len();
        self.records.retain(|_, r| r.expires_at > now);
        Ok(before.saturating_sub(self.records.len()) as u64)
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lifecycle(&self) -> &StoreLifecycle {
        &self.lifecycle
    }
}

/// Store backed by `idempotency_keys`.
#[derive(Debug)]
pub struct PgIdempotencyStore {
    pool: PgPool,
    ttl: Duration,
    lifecycle: StoreLifecycle,
}

#[derive(Debug, FromRow)]
struct IdempotencyRow {
    key: String,
    request_hash: String,
    response_code: Option<i32>,
    response_body: Option<Vec<u8>>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<IdempotencyRow> for IdempotencyRecord {
    fn from(row: IdempotencyRow) -> Self {
        Self {
            key: row.key,
            request_hash: row.request_hash,
            response_code: row.response_code.and_then(|c| u16::try_from(c).ok()),
            response_body: row.response_body,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ttl: Duration::hours(DEFAULT_IDEMPOTENCY_TTL_HOURS),
            lifecycle: StoreLifecycle::new("idempotency"),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    async fn fetch(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query_as::<_, IdempotencyRow>(
            r#"
            SELECT key, request_hash, response_code, response_body, created_at, expires_at
            FROM idempotency_keys
            WHERE key = $1 AND expires_at > $2
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(IdempotencyRecord::from))
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.lifecycle.ensure_readable()?;
        self.fetch(key, now).await
    }

    async fn reserve(
        &self,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError> {
        self.lifecycle.ensure_writable()?;

        // A racing reservation can disappear between the insert and the
        // re-read (released or expired); retry once in that case.
        for _ in 0..2 {
            sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND expires_at <= $2")
                .bind(key)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO idempotency_keys (key, request_hash, created_at, expires_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(request_hash)
            .bind(now)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

            if inserted.rows_affected() == 1 {
                return Ok(ReserveOutcome::Reserved);
            }

            if let Some(existing) = self.fetch(key, now).await? {
                return Ok(if existing.request_hash == request_hash {
                    ReserveOutcome::AlreadyReserved(existing)
                } else {
                    ReserveOutcome::Conflict(existing)
                });
            }
        }

        Err(StoreError::Unavailable(format!("idempotency key {key} is contended")))
    }

    async fn complete(
        &self,
        key: &str,
        response_code: u16,
        response_body: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lifecycle.ensure_readable()?;
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET response_code = $2,
                response_body = $3,
                expires_at = GREATEST(expires_at, $4)
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(i32::from(response_code))
        .bind(response_body)
        .bind(expires_at(now, self.ttl))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("idempotency key {key}")));
        }
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.lifecycle.ensure_readable()?;
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND response_code IS NULL")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.lifecycle.ensure_readable()?;
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lifecycle(&self) -> &StoreLifecycle {
        &self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(60)
    }

    #[tokio::test]
    async fn test_reserve_complete_replay() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();

        assert_eq!(
            store.reserve("k", "h1", now, lease(now)).await.unwrap(),
            ReserveOutcome::Reserved
        );

        match store.reserve("k", "h1", now, lease(now)).await.unwrap() {
            ReserveOutcome::AlreadyReserved(r) => assert!(!r.is_completed()),
            other => panic!("expected in-flight reservation, got {other:?}"),
        }

        store.complete("k", 201, b"{\"id\":1}".to_vec(), now).await.unwrap();
        let record = store.get("k", now).await.unwrap().unwrap();
        assert_eq!(record.response_code, Some(201));
        assert_eq!(record.response_body.as_deref(), Some(&b"{\"id\":1}"[..]));
        assert!(record.expires_at >= now + Duration::hours(DEFAULT_IDEMPOTENCY_TTL_HOURS));
    }

    #[tokio::test]
    async fn test_different_hash_conflicts() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        store.reserve("k", "h1", now, lease(now)).await.unwrap();

        assert!(matches!(
            store.reserve("k", "h2", now, lease(now)).await.unwrap(),
            ReserveOutcome::Conflict(r) if r.request_hash == "h1"
        ));
    }

    #[tokio::test]
    async fn test_expired_key_can_be_reserved_again() {
        let store = InMemoryIdempotencyStore::new().with_ttl(Duration::seconds(10));
        let now = Utc::now();
        store.reserve("k", "h1", now, lease(now)).await.unwrap();
        store.complete("k", 200, Vec::new(), now).await.unwrap();

        let later = now + Duration::seconds(61);
        assert_eq!(store.get("k", later).await.unwrap(), None);
        assert_eq!(
            store.reserve("k", "h2", later, lease(later)).await.unwrap(),
            ReserveOutcome::Reserved
        );
    }

    #[tokio::test]
    async fn test_release_keeps_completed_records() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();

        store.reserve("a", "h", now, lease(now)).await.unwrap();
        store.release("a").await.unwrap();
        assert!(store.get("a", now).await.unwrap().is_none());

        store.reserve("b", "h", now, lease(now)).await.unwrap();
        store.complete("b", 200, Vec::new(), now).await.unwrap();
        store.release("b").await.unwrap();
        assert!(store.get("b", now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_complete_without_reservation_is_not_found() {
        let store = InMemoryIdempotencyStore::new();
        assert!(matches!(
            store.complete("missing", 200, Vec::new(), Utc::now()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_have_one_winner() {
        let store = std::sync::Arc::new(InMemoryIdempotencyStore::new());
        let now = Utc::now();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.reserve("k", "h", now, lease(now)).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() == ReserveOutcome::Reserved {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        store.reserve("old", "h", now, now + Duration::seconds(1)).await.unwrap();
        store.reserve("new", "h", now, now + Duration::hours(1)).await.unwrap();

        assert_eq!(store.purge_expired(now + Duration::seconds(5)).await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }
}
