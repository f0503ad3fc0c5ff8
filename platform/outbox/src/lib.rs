//! # Outbox
//!
//! Outbound side of the event contract. A business mutation and the events
//! it emits are committed together ([`AtomicStore::transact`] in memory,
//! [`PgOutbox::enqueue`] inside a Postgres transaction); the [`Relay`] then
//! drains pending records to the sinks in insertion order.

mod memory;
mod postgres;
mod record;
pub mod relay;
pub mod sink;

pub use memory::{AtomicStore, UnitOfWork};
pub use postgres::PgOutbox;
pub use record::OutboxRecord;
pub use relay::{Relay, RelayConfig, RelayError, RelayHandle, TickReport};
pub use sink::{AnalyticsSink, BusSink, DomainSink, SinkError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{StoreError, StoreLifecycle};
use uuid::Uuid;

/// Relay-facing view of an outbox.
///
/// Relay updates are accepted while the store is draining so that in-flight
/// records can still be settled.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Records with neither `sent_at` nor `dead_lettered_at`, oldest first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Idempotent; a second call keeps the first timestamp.
    async fn mark_sent(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Count a failed publish; returns the attempts so far.
    async fn record_failure(&self, record_id: Uuid, error: &str) -> Result<u32, StoreError>;

    /// Take a record out of the relay after it was dead-lettered.
    async fn park(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Mark every unsent record carrying `event_id`. Used after a DLQ replay.
    async fn mark_sent_by_event_id(
        &self,
        event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete records sent before `before`; returns how many went. Pending and
    /// parked records are kept.
    async fn purge_sent(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    fn lifecycle(&self) -> &StoreLifecycle;
}
