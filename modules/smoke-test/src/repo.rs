//! Thing persistence
//!
//! Every write that announces itself does so through the outbox in the same
//! atomic unit: a thing row never exists without its `thing.created` record
//! and vice versa.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{CodecError, StoreError, StoreLifecycle};
use outbox::{AtomicStore, Outbox, PgOutbox};
use platform_http_contracts::ApiError;
use sqlx::PgPool;
use uuid::Uuid;

use crate::events::thing_created;
use crate::models::Thing;

pub const MAX_NAME_LEN: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ThingError {
    #[error("invalid thing: {0}")]
    Invalid(String),

    #[error("thing {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to build event: {0}")]
    Event(#[from] CodecError),
}

impl From<ThingError> for ApiError {
    fn from(e: ThingError) -> Self {
        match &e {
            ThingError::Invalid(_) => ApiError::invalid_input(e.to_string()),
            ThingError::NotFound(_) => ApiError::not_found(e.to_string()),
            ThingError::Store(err) if err.is_transient() => ApiError::transient(e.to_string()),
            ThingError::Store(_) | ThingError::Event(_) => ApiError::internal(e.to_string()),
        }
    }
}

pub fn validate_name(name: &str) -> Result<&str, ThingError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ThingError::Invalid("name must not be empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ThingError::Invalid(format!("name exceeds {MAX_NAME_LEN} characters")));
    }
    Ok(name)
}

fn new_thing(name: &str, created_by: &str, now: DateTime<Utc>) -> Thing {
    Thing {
        id: format!("t-{}", Uuid::new_v4().simple()),
        name: name.to_string(),
        created_by: created_by.to_string(),
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
pub trait ThingStore: Send + Sync {
    /// Insert a thing and enqueue `thing.created` atomically.
    async fn create(
        &self,
        name: &str,
        created_by: &str,
        trace_id: Option<&str>,
    ) -> Result<Thing, ThingError>;

    async fn get(&self, id: &str) -> Result<Option<Thing>, ThingError>;

    /// Setting the current name again is a no-op apart from `updated_at`.
    async fn rename(&self, id: &str, name: &str) -> Result<Thing, ThingError>;

    /// The outbox the relay drains.
    fn outbox(&self) -> Arc<dyn Outbox>;

    fn lifecycle(&self) -> &StoreLifecycle;
}

/// In-process backend; things and their outbox share one lock.
pub struct MemoryThingStore {
    inner: Arc<AtomicStore<BTreeMap<String, Thing>>>,
}

impl MemoryThingStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicStore::new(BTreeMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read(BTreeMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryThingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ThingStore for MemoryThingStore {
    async fn create(
        &self,
        name: &str,
        created_by: &str,
        trace_id: Option<&str>,
    ) -> Result<Thing, ThingError> {
        let name = validate_name(name)?;
        let thing = new_thing(name, created_by, Utc::now());
        let envelope = thing_created(&thing, trace_id)?;

        self.inner.transact(|unit| -> Result<(), ThingError> {
            unit.state_mut().insert(thing.id.clone(), thing.clone());
            unit.enqueue(envelope);
            Ok(())
        })?;
        Ok(thing)
    }

    async fn get(&self, id: &str) -> Result<Option<Thing>, ThingError> {
        Ok(self.inner.read(|things| things.get(id).cloned())?)
    }

    async fn rename(&self, id: &str, name: &str) -> Result<Thing, ThingError> {
        let name = validate_name(name)?;
        let now = Utc::now();
        self.inner.transact(|unit| {
            let thing = unit
                .state_mut()
                .get_mut(id)
                .ok_or_else(|| ThingError::NotFound(id.to_string()))?;
            thing.name = name.to_string();
            thing.updated_at = now;
            Ok(thing.clone())
        })
    }

    fn outbox(&self) -> Arc<dyn Outbox> {
        self.inner.clone()
    }

    fn lifecycle(&self) -> &StoreLifecycle {
        Outbox::lifecycle(self.inner.as_ref())
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

pub struct PgThingStore {
    pool: PgPool,
    outbox: Arc<PgOutbox>,
    lifecycle: StoreLifecycle,
}

impl PgThingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            outbox: Arc::new(PgOutbox::new(pool.clone())),
            pool,
            lifecycle: StoreLifecycle::new("things"),
        }
    }
}

#[async_trait]
impl ThingStore for PgThingStore {
    async fn create(
        &self,
        name: &str,
        created_by: &str,
        trace_id: Option<&str>,
    ) -> Result<Thing, ThingError> {
        self.lifecycle.ensure_writable()?;
        let name = validate_name(name)?;
        let now = Utc::now();
        let thing = new_thing(name, created_by, now);
        let envelope = thing_created(&thing, trace_id)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO things (id, name, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&thing.id)
        .bind(&thing.name)
        .bind(&thing.created_by)
        .bind(thing.created_at)
        .bind(thing.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        PgOutbox::enqueue(&mut tx, &envelope, now).await?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(thing_id = %thing.id, event_id = %envelope.event_id(), "thing created");
        Ok(thing)
    }

    async fn get(&self, id: &str) -> Result<Option<Thing>, ThingError> {
        self.lifecycle.ensure_readable()?;
        let thing = sqlx::query_as::<_, Thing>(
            "SELECT id, name, created_by, created_at, updated_at FROM things WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(thing)
    }

    async fn rename(&self, id: &str, name: &str) -> Result<Thing, ThingError> {
        self.lifecycle.ensure_writable()?;
        let name = validate_name(name)?;
        sqlx::query_as::<_, Thing>(
            r#"
            UPDATE things SET name = $2, updated_at = $3
            WHERE id = $1
            RETURNING id, name, created_by, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ThingError::NotFound(id.to_string()))
    }

    fn outbox(&self) -> Arc<dyn Outbox> {
        self.outbox.clone()
    }

    fn lifecycle(&self) -> &StoreLifecycle {
        &self.lifecycle
    }
}
