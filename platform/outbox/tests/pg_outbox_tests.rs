//! Postgres outbox tests. Run with `cargo test -p outbox -- --ignored`
//! against a database reachable at DATABASE_URL.

mod common;

use chrono::Utc;
use event_bus::{EventClass, EventEnvelope};
use outbox::{Outbox, PgOutbox};
use serde_json::json;
use serial_test::serial;

fn envelope(class: EventClass, id: &str) -> EventEnvelope {
    EventEnvelope::builder("thing.created", "smoke-test")
        .class(class)
        .partition_by_data("id")
        .data(json!({"id": id}))
        .build()
        .unwrap()
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_pg_enqueue_commits_with_transaction() {
    let pool = common::setup_pool().await;
    let outbox = PgOutbox::new(pool.clone());

    let mut tx = pool.begin().await.unwrap();
    PgOutbox::enqueue(&mut tx, &envelope(EventClass::Domain, "rolled-back"), Utc::now())
        .await
        .unwrap();
    tx.rollback().await.unwrap();
    assert!(outbox.list_pending(10).await.unwrap().is_empty());

    let mut tx = pool.begin().await.unwrap();
    let first = PgOutbox::enqueue(&mut tx, &envelope(EventClass::Domain, "a"), Utc::now())
        .await
        .unwrap();
    let second = PgOutbox::enqueue(&mut tx, &envelope(EventClass::AnalyticsOnly, "b"), Utc::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let pending = outbox.list_pending(10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].record_id, first);
    assert_eq!(pending[1].record_id, second);
    assert_eq!(pending[1].event_class, EventClass::AnalyticsOnly);
    assert_eq!(pending[0].envelope.partition_key(), "a");
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_pg_failure_park_and_mark_sent() {
    let pool = common::setup_pool().await;
    let outbox = PgOutbox::new(pool.clone());

    let env = envelope(EventClass::Domain, "a");
    let mut tx = pool.begin().await.unwrap();
    let id = PgOutbox::enqueue(&mut tx, &env, Utc::now()).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(outbox.record_failure(id, "down").await.unwrap(), 1);
    assert_eq!(outbox.record_failure(id, "down").await.unwrap(), 2);

    outbox.park(id, Utc::now()).await.unwrap();
    assert!(outbox.list_pending(10).await.unwrap().is_empty());

    assert!(outbox.mark_sent_by_event_id(env.event_id(), Utc::now()).await.unwrap());
    assert!(!outbox.mark_sent_by_event_id(env.event_id(), Utc::now()).await.unwrap());
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_pg_purge_sent_keeps_pending_and_parked() {
    let pool = common::setup_pool().await;
    let outbox = PgOutbox::new(pool.clone());

    let mut tx = pool.begin().await.unwrap();
    let sent = PgOutbox::enqueue(&mut tx, &envelope(EventClass::Domain, "sent"), Utc::now())
        .await
        .unwrap();
    let parked = PgOutbox::enqueue(&mut tx, &envelope(EventClass::Domain, "parked"), Utc::now())
        .await
        .unwrap();
    let pending = PgOutbox::enqueue(&mut tx, &envelope(EventClass::Domain, "pending"), Utc::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let hour_ago = Utc::now() - chrono::Duration::hours(1);
    outbox.mark_sent(sent, hour_ago).await.unwrap();
    outbox.park(parked, hour_ago).await.unwrap();

    assert_eq!(outbox.purge_sent(Utc::now()).await.unwrap(), 1);

    let left: Vec<uuid::Uuid> =
        sqlx::query_scalar("SELECT record_id FROM events_outbox ORDER BY seq")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(left, vec![parked, pending]);
}
