use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{StoreError, StoreLifecycle};
use uuid::Uuid;

use crate::{DlqQuery, DlqRecord, DlqStore};

/// Process-local DLQ, used by tests and the in-memory service profile.
#[derive(Debug)]
pub struct InMemoryDlqStore {
    records: RwLock<Vec<DlqRecord>>,
    lifecycle: StoreLifecycle,
}

impl Default for InMemoryDlqStore {
    fn default() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            lifecycle: StoreLifecycle::new("dlq"),
        }
    }
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("dlq lock poisoned".to_string())
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn create(&self, record: DlqRecord) -> Result<(), StoreError> {
        self.lifecycle.ensure_writable()?;
        self.records.write().map_err(poisoned)?.push(record);
        Ok(())
    }

    async fn query(&self, query: &DlqQuery) -> Result<Vec<DlqRecord>, StoreError> {
        self.lifecycle.ensure_readable()?;
        let records = self.records.read().map_err(poisoned)?;
        let mut matched: Vec<DlqRecord> =
            records.iter().filter(|r| query.matches(r)).cloned().collect();
        // Newest first; insertion order breaks ties
        matched.reverse();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.truncate(query.effective_limit() as usize);
        Ok(matched)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DlqRecord>, StoreError> {
        self.lifecycle.ensure_readable()?;
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn mark_replayed(
        &self,
        ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        self.lifecycle.ensure_writable()?;
        let mut records = self.records.write().map_err(poisoned)?;
        let mut marked = Vec::new();
        for record in records.iter_mut() {
            if record.replayed_at.is_none() && ids.contains(&record.id) {
                record.replayed_at = Some(at);
                marked.push(record.id);
            }
        }
        Ok(marked)
    }

    fn lifecycle(&self) -> &StoreLifecycle {
        &self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(topic: &str, at: DateTime<Utc>) -> DlqRecord {
        DlqRecord::new(topic, "boom", b"{}".to_vec(), at)
    }

    #[tokio::test]
    async fn test_query_newest_first_with_limit() {
        let store = InMemoryDlqStore::new();
        let t0 = Utc::now();
        for i in 0..5 {
            store.create(record(&format!("t{i}"), t0 + Duration::seconds(i))).await.unwrap();
        }

        let rows = store.query(&DlqQuery::new().limit(2)).await.unwrap();
        let topics: Vec<_> = rows.iter().map(|r| r.source_topic.as_str()).collect();
        assert_eq!(topics, vec!["t4", "t3"]);
    }

    #[tokio::test]
    async fn test_mark_replayed_only_once() {
        let store = InMemoryDlqStore::new();
        let r = record("t", Utc::now());
        let id = r.id;
        store.create(r).await.unwrap();

        let first = store.mark_replayed(&[id, Uuid::new_v4()], Utc::now()).await.unwrap();
        assert_eq!(first, vec![id]);
        let stamped = store.get(id).await.unwrap().unwrap().replayed_at;

        let second = store.mark_replayed(&[id], Utc::now() + Duration::hours(1)).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(store.get(id).await.unwrap().unwrap().replayed_at, stamped);

        assert!(store.query(&DlqQuery::new()).await.unwrap().is_empty());
        assert_eq!(store.query(&DlqQuery::new().include_replayed(true)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_draining_store_rejects_writes() {
        let store = InMemoryDlqStore::new();
        store.lifecycle().begin_drain();
        let err = store.create(record("t", Utc::now())).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.query(&DlqQuery::new()).await.is_ok());
    }
}
