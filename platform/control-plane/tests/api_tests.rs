use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{body::Body, http::Request, Router};
use chrono::Utc;
use control_plane::{router, DlqController};
use dlq::{DlqRecord, DlqStore, InMemoryDlqStore};
use event_bus::{EventClass, EventEnvelope};
use http_body_util::BodyExt;
use idempotency::{Idempotency, InMemoryIdempotencyStore};
use outbox::{DomainSink, SinkError};
use serde_json::{json, Value};
use tower::ServiceExt;

#[derive(Default)]
struct CapturingSink {
    published: Mutex<Vec<String>>,
}

#[async_trait]
impl DomainSink for CapturingSink {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        self.published.lock().unwrap().push(envelope.event_id().to_string());
        Ok(())
    }
}

struct Harness {
    app: Router,
    dlq: Arc<InMemoryDlqStore>,
    sink: Arc<CapturingSink>,
}

fn harness() -> Harness {
    let dlq = Arc::new(InMemoryDlqStore::new());
    let sink = Arc::new(CapturingSink::default());
    let controller = Arc::new(DlqController::new(dlq.clone(), sink.clone()));
    let idempotency = Idempotency::new(Arc::new(InMemoryIdempotencyStore::new()));
    Harness {
        app: router(controller, idempotency),
        dlq,
        sink,
    }
}

async fn seed(dlq: &InMemoryDlqStore, error_type: &str) -> DlqRecord {
    let envelope = EventEnvelope::builder("thing.created", "smoke-test")
        .class(EventClass::Domain)
        .partition_by_data("id")
        .data(json!({"id": "t-1"}))
        .build()
        .unwrap();
    let topic = "smoke-test.events.thing.created";
    let record = DlqRecord::for_envelope(topic, &envelope, "broker down", Utc::now())
        .unwrap()
        .with_error_type(error_type)
        .with_retry_count(3);
    dlq.create(record.clone()).await.unwrap();
    record
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri)
        .header("authorization", "Bearer ops-1")
        .body(Body::empty())
        .unwrap()
}

fn replay(key: &str, role: &str, body: Value) -> Request<Body> {
    Request::post("/api/dlq/replay")
        .header("authorization", "Bearer ops-1")
        .header("x-actor-role", role)
        .header("idempotency-key", key)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let h = harness();
    let res = h
        .app
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert!(res.headers().contains_key("x-request-id"));
    let body = json_body(res).await;
    assert_eq!(body["data"]["status"], "ok");
}

#[tokio::test]
async fn test_list_filters_and_get() {
    let h = harness();
    let a = seed(&h.dlq, "sink_publish_failed").await;
    seed(&h.dlq, "partition_key_mismatch").await;

    let res = h
        .app
        .clone()
        .oneshot(get("/api/dlq?error_type=sink_publish_failed"))
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body = json_body(res).await;
    let items = body["data"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], a.id.to_string());
    assert_eq!(items[0]["retry_count"], 3);

    let res = h.app.clone().oneshot(get(&format!("/api/dlq/{}", a.id))).await.unwrap();
    assert_eq!(res.status(), 200);

    let res = h
        .app
        .oneshot(get(&format!("/api/dlq/{}", uuid::Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
    let body = json_body(res).await;
    assert_eq!(body["error"]["code"], "not_found");
    assert!(body["error"]["request_id"].is_string());
}

#[tokio::test]
async fn test_listing_requires_bearer() {
    let h = harness();
    let res = h
        .app
        .oneshot(Request::get("/api/dlq").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let h = harness();
    seed(&h.dlq, "sink_publish_failed").await;
    seed(&h.dlq, "sink_publish_failed").await;
    let filter = json!({"error_type": "sink_publish_failed"});

    let first = h
        .app
        .clone()
        .oneshot(replay("replay:dlq:batch-1", "operator", filter.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let first_body = json_body(first).await;
    assert_eq!(first_body["data"]["replayed"], 2);

    let second = h
        .app
        .oneshot(replay("replay:dlq:batch-1", "operator", filter))
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(json_body(second).await, first_body, "replayed response is verbatim");
    assert_eq!(h.sink.published.lock().unwrap().len(), 2, "events re-dispatched once");
}

#[tokio::test]
async fn test_replay_requires_operator_role_and_shaped_key() {
    let h = harness();
    seed(&h.dlq, "sink_publish_failed").await;

    let res = h
        .app
        .clone()
        .oneshot(replay("replay:dlq:batch-2", "user", json!({})))
        .await
        .unwrap();
    assert_eq!(res.status(), 403);

    let res = h.app.oneshot(replay("whatever", "operator", json!({}))).await.unwrap();
    assert_eq!(res.status(), 400);
    assert!(h.sink.published.lock().unwrap().is_empty());
}
