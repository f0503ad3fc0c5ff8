use std::sync::Arc;

use chrono::{DateTime, Utc};
use event_bus::StoreError;

use crate::store::IdempotencyStore;

/// Ownership of a reserved idempotency key.
///
/// Exactly one of [`complete`](Self::complete) or [`release`](Self::release)
/// settles the reservation. Dropping an unsettled guard (handler panic,
/// cancelled request) releases the key in the background.
pub struct ReservationGuard {
    store: Arc<dyn IdempotencyStore>,
    key: String,
    settled: bool,
}

impl ReservationGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            settled: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn complete(
        mut self,
        response_code: u16,
        response_body: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.settled = true;
        let result = self.store.complete(&self.key, response_code, response_body, now).await;
        if result.is_err() {
            // never leave a reservation that can neither replay nor be retried
            if let Err(e) = self.store.release(&self.key).await {
                tracing::warn!(key = %self.key, error = %e, "failed to release idempotency key");
            }
        }
        result
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        self.settled = true;
        self.store.release(&self.key).await
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                key = %self.key,
                "idempotency key left reserved until its lease expires"
            );
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            if let Err(e) = store.release(&key).await {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "failed to release abandoned idempotency key"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryIdempotencyStore, ReserveOutcome};
    use chrono::Duration;

    #[tokio::test]
    async fn test_dropped_guard_releases_reservation() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let now = Utc::now();
        assert_eq!(
            store.reserve("k", "h", now, now + Duration::seconds(60)).await.unwrap(),
            ReserveOutcome::Reserved
        );

        drop(ReservationGuard::new(store.clone(), "k"));
        for _ in 0..50 {
            if store.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_completed_guard_keeps_record() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let now = Utc::now();
        store.reserve("k", "h", now, now + Duration::seconds(60)).await.unwrap();

        ReservationGuard::new(store.clone(), "k")
            .complete(201, b"{}".to_vec(), now)
            .await
            .unwrap();
        let record = store.get("k", now).await.unwrap().unwrap();
        assert_eq!(record.response_code, Some(201));
    }
}
