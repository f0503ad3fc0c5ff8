//! # Dead Letter Queue
//!
//! Durable record of deliveries that could not be completed: outbound
//! publishes that exhausted the relay's retry policy and inbound envelopes
//! rejected terminally by a consumer. Records are retained for operator
//! inspection and replay; replay marks them exactly once.

mod memory;
mod model;
mod postgres;

pub use memory::InMemoryDlqStore;
pub use model::{DlqQuery, DlqRecord, DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT};
pub use postgres::PgDlqStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{StoreError, StoreLifecycle};
use uuid::Uuid;

/// Storage for dead-lettered deliveries
#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn create(&self, record: DlqRecord) -> Result<(), StoreError>;

    /// Matching records, newest first, at most `query.effective_limit()`.
    async fn query(&self, query: &DlqQuery) -> Result<Vec<DlqRecord>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<DlqRecord>, StoreError>;

    /// Set `replayed_at` on records where it is unset. Returns the ids that
    /// were actually marked; already-replayed or unknown ids are skipped.
    async fn mark_replayed(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    fn lifecycle(&self) -> &StoreLifecycle;
}
