//! In-memory atomic unit: business state and outbox log behind one lock.
//!
//! A transaction works on a copy of the state and stages its outbox records;
//! both are published together when the closure returns `Ok`, and discarded
//! together otherwise. Readers never observe one without the other.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{EventEnvelope, StoreError, StoreLifecycle};
use uuid::Uuid;

use crate::{Outbox, OutboxRecord};

struct Inner<S> {
    state: S,
    log: Vec<OutboxRecord>,
}

/// Business state `S` plus its outbox.
pub struct AtomicStore<S> {
    inner: Mutex<Inner<S>>,
    lifecycle: StoreLifecycle,
}

/// Handle passed to a transaction closure.
pub struct UnitOfWork<S> {
    state: S,
    staged: Vec<OutboxRecord>,
    now: DateTime<Utc>,
}

impl<S> UnitOfWork<S> {
    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Stage an envelope for the outbox; it becomes visible on commit.
    pub fn enqueue(&mut self, envelope: EventEnvelope) -> Uuid {
        let record = OutboxRecord::new(envelope, self.now);
        let id = record.record_id;
        self.staged.push(record);
        id
    }
}

impl<S: Clone + Send> AtomicStore<S> {
    pub fn new(state: S) -> Self {
        Self {
            inner: Mutex::new(Inner { state, log: Vec::new() }),
            lifecycle: StoreLifecycle::new("outbox"),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<S>>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("outbox lock poisoned".to_string()))
    }

    /// Run `f` as one atomic unit.
    pub fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut UnitOfWork<S>) -> Result<T, E>,
        E: From<StoreError>,
    {
        self.lifecycle.ensure_writable()?;
        let mut inner = self.lock()?;

        let mut unit = UnitOfWork {
            state: inner.state.clone(),
            staged: Vec::new(),
            now: Utc::now(),
        };
        let value = f(&mut unit)?;

        inner.state = unit.state;
        inner.log.extend(unit.staged);
        Ok(value)
    }

    /// Read a consistent snapshot of the business state.
    pub fn read<T>(&self, f: impl FnOnce(&S) -> T) -> Result<T, StoreError> {
        self.lifecycle.ensure_readable()?;
        let inner = self.lock()?;
        Ok(f(&inner.state))
    }

    /// Every outbox record, in insertion order.
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.lock().map(|inner| inner.log.clone()).unwrap_or_default()
    }

    fn with_record<T>(
        &self,
        record_id: Uuid,
        f: impl FnOnce(&mut OutboxRecord) -> T,
    ) -> Result<T, StoreError> {
        let mut inner = self.lock()?;
        let record = inner
            .log
            .iter_mut()
            .find(|r| r.record_id == record_id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox record {record_id}")))?;
        Ok(f(record))
    }
}

#[async_trait]
impl<S: Clone + Send + 'static> Outbox for AtomicStore<S> {
    async fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        self.lifecycle.ensure_readable()?;
        let inner = self.lock()?;
        Ok(inner
            .log
            .iter()
            .filter(|r| r.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.lifecycle.ensure_readable()?;
        self.with_record(record_id, |record| {
            if record.sent_at.is_none() {
                record.sent_at = Some(at);
            }
        })
    }

    async fn record_failure(&self, record_id: Uuid, error: &str) -> Result<u32, StoreError> {
        self.lifecycle.ensure_readable()?;
        self.with_record(record_id, |record| {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            record.attempts
        })
    }

    async fn park(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.lifecycle.ensure_readable()?;
        self.with_record(record_id, |record| {
            if record.dead_lettered_at.is_none() {
                record.dead_lettered_at = Some(at);
            }
        })
    }

    async fn mark_sent_by_event_id(
        &self,
        event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.lifecycle.ensure_readable()?;
        let mut inner = self.lock()?;
        let mut marked = false;
        for record in inner.log.iter_mut() {
            if record.envelope.event_id() == event_id && record.sent_at.is_none() {
                record.sent_at = Some(at);
                marked = true;
            }
        }
        Ok(marked)
    }

    async fn purge_sent(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.lifecycle.ensure_readable()?;
        let mut inner = self.lock()?;
        let len = inner.log.len();
        inner.log.retain(|r| !r.sent_at.is_some_and(|at| at < before));
        Ok((len - inner.log.len()) as u64)
    }

    fn lifecycle(&self) -> &StoreLifecycle {
        &self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::EventClass;
    use serde_json::json;
    use std::collections::BTreeMap;

    type Things = BTreeMap<String, String>;

    fn envelope(id: &str) -> EventEnvelope {
        EventEnvelope::builder("thing.created", "smoke-test")
            .class(EventClass::Domain)
            .partition_by_data("id")
            .data(json!({"id": id}))
            .build()
            .unwrap()
    }

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("store: {0}")]
        Store(#[from] StoreError),
        #[error("business rule violated")]
        Rule,
    }

    fn enqueue_many(store: &AtomicStore<Things>, n: usize) -> Vec<Uuid> {
        (0..n)
            .map(|i| {
                store
                    .transact(|unit| -> Result<Uuid, TestError> {
                        Ok(unit.enqueue(envelope(&format!("t-{i}"))))
                    })
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_commit_publishes_state_and_outbox_together() {
        let store = AtomicStore::new(Things::new());
        store
            .transact(|unit| -> Result<(), TestError> {
                unit.state_mut().insert("t-1".into(), "a".into());
                unit.enqueue(envelope("t-1"));
                Ok(())
            })
            .unwrap();

        assert_eq!(store.read(|s| s.len()).unwrap(), 1);
        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_class, EventClass::Domain);
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back_both() {
        let store = AtomicStore::new(Things::new());
        let result = store.transact(|unit| -> Result<(), TestError> {
            unit.state_mut().insert("t-1".into(), "a".into());
            unit.enqueue(envelope("t-1"));
            Err(TestError::Rule)
        });

        assert!(matches!(result, Err(TestError::Rule)));
        assert_eq!(store.read(|s| s.len()).unwrap(), 0);
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_pending_order_and_marking() {
        let store = AtomicStore::new(Things::new());
        let ids = enqueue_many(&store, 3);

        let now = Utc::now();
        store.mark_sent(ids[0], now).await.unwrap();
        store.mark_sent(ids[0], now + chrono::Duration::seconds(5)).await.unwrap();
        store.park(ids[1], now).await.unwrap();

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record_id, ids[2]);

        // mark_sent keeps the first timestamp
        let first = store.records().into_iter().find(|r| r.record_id == ids[0]).unwrap();
        assert_eq!(first.sent_at, Some(now));
    }

    #[tokio::test]
    async fn test_record_failure_counts_attempts() {
        let store = AtomicStore::new(Things::new());
        let id = store
            .transact(|unit| -> Result<Uuid, TestError> { Ok(unit.enqueue(envelope("t-1"))) })
            .unwrap();

        assert_eq!(store.record_failure(id, "down").await.unwrap(), 1);
        assert_eq!(store.record_failure(id, "down").await.unwrap(), 2);
        assert!(matches!(
            store.record_failure(Uuid::new_v4(), "x").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_sent_shrinks_the_log() {
        let store = AtomicStore::new(Things::new());
        let ids = enqueue_many(&store, 4);

        let now = Utc::now();
        let hour_ago = now - chrono::Duration::hours(1);
        store.mark_sent(ids[0], hour_ago).await.unwrap();
        store.mark_sent(ids[1], now).await.unwrap();
        store.park(ids[2], hour_ago).await.unwrap();

        let cutoff = now - chrono::Duration::minutes(30);
        assert_eq!(store.purge_sent(cutoff).await.unwrap(), 1);

        let left: Vec<Uuid> = store.records().into_iter().map(|r| r.record_id).collect();
        assert_eq!(left, vec![ids[1], ids[2], ids[3]]);
        assert_eq!(store.list_pending(10).await.unwrap()[0].record_id, ids[3]);
        assert_eq!(store.purge_sent(cutoff).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_draining_store_rejects_transactions() {
        let store = AtomicStore::new(Things::new());
        store.lifecycle().begin_drain();
        let result = store.transact(|_| -> Result<(), TestError> { Ok(()) });
        assert!(matches!(result, Err(TestError::Store(StoreError::Unavailable(_)))));
    }
}
