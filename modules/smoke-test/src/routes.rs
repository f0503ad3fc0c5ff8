use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use dlq::{DlqRecord, DlqStore};
use event_bus::{codec, subject_for, EnvelopeError};
use event_consumer::{HandlerError, InboundPipeline, PipelineError, ProcessOutcome};
use idempotency::{idempotency_middleware, Idempotency};
use platform_http_contracts::{
    request_id_middleware, Actor, ApiError, ErrorKind, RequestId, SuccessEnvelope,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::events::SERVICE_NAME;
use crate::models::{CreateThingRequest, Thing};
use crate::repo::ThingStore;

/// Consumer group recorded on DLQ entries written by `POST /api/events`.
pub const INGEST_CONSUMER_GROUP: &str = "smoke-test-http";
/// DLQ topic for bodies that never decoded into an envelope.
pub const INGEST_TOPIC: &str = "smoke-test.ingest";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ThingStore>,
    pub pipeline: Arc<InboundPipeline>,
    pub dlq: Arc<dyn DlqStore>,
}

pub fn router(state: AppState, idempotency: Idempotency) -> Router {
    let mutating = Router::new()
        .route("/api/things", post(create_thing))
        .route("/api/events", post(ingest_event))
        .route_layer(middleware::from_fn_with_state(idempotency, idempotency_middleware));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/things/{id}", get(get_thing))
        .merge(mutating)
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

async fn health(State(state): State<AppState>) -> SuccessEnvelope<Value> {
    SuccessEnvelope::new(json!({
        "service": SERVICE_NAME,
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "things_store": format!("{:?}", state.store.lifecycle().state()),
        "dlq_store": format!("{:?}", state.dlq.lifecycle().state()),
    }))
}

/// POST /api/things - create a thing and announce it
async fn create_thing(
    State(state): State<AppState>,
    actor: Actor,
    request_id: RequestId,
    Json(req): Json<CreateThingRequest>,
) -> Result<(StatusCode, SuccessEnvelope<Thing>), ApiError> {
    let thing = state
        .store
        .create(&req.name, &actor.subject, Some(request_id.as_str()))
        .await?;
    Ok((StatusCode::CREATED, SuccessEnvelope::new(thing)))
}

async fn get_thing(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<String>,
) -> Result<SuccessEnvelope<Thing>, ApiError> {
    state
        .store
        .get(&id)
        .await?
        .map(SuccessEnvelope::new)
        .ok_or_else(|| ApiError::not_found(format!("thing {id} not found")))
}

/// POST /api/events - push one encoded envelope through the inbound pipeline
///
/// Contract failures are dead-lettered and answered with 400. Transient
/// failures are not; the caller is expected to retry. Like every mutating
/// route it requires an `Idempotency-Key`; a resubmission under the same key
/// replays the first accepted outcome.
async fn ingest_event(
    State(state): State<AppState>,
    _actor: Actor,
    body: Bytes,
) -> Result<(StatusCode, SuccessEnvelope<Value>), ApiError> {
    let now = Utc::now();
    let envelope = match codec::decode(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            let error = PipelineError::from(e);
            let record = DlqRecord::new(INGEST_TOPIC, error.to_string(), body.to_vec(), now);
            dead_letter(&state, record, &error).await;
            return Err(api_error(&error));
        }
    };

    match state.pipeline.process(&envelope, now).await {
        Ok(outcome) => {
            let (status, label) = match outcome {
                ProcessOutcome::Processed => (StatusCode::ACCEPTED, "processed"),
                ProcessOutcome::Duplicate => (StatusCode::OK, "duplicate"),
            };
            Ok((
                status,
                SuccessEnvelope::new(json!({
                    "event_id": envelope.event_id(),
                    "outcome": label,
                })),
            ))
        }
        Err(error) => {
            if error.is_terminal() {
                let record =
                    DlqRecord::new(subject_for(&envelope), error.to_string(), body.to_vec(), now)
                        .with_event_id(envelope.event_id());
                dead_letter(&state, record, &error).await;
            }
            Err(api_error(&error))
        }
    }
}

async fn dead_letter(state: &AppState, record: DlqRecord, error: &PipelineError) {
    let record = record
        .with_consumer_group(INGEST_CONSUMER_GROUP)
        .with_error_type(error.reason())
        .with_retry_count(1);
    tracing::warn!(
        topic = %record.source_topic,
        error_type = error.reason(),
        error = %error,
        "inbound event rejected, sending to DLQ"
    );
    if let Err(e) = state.dlq.create(record).await {
        tracing::error!(error = %e, "failed to write DLQ record");
    }
}

fn api_error(error: &PipelineError) -> ApiError {
    let kind = match error {
        PipelineError::Decode(_) => ErrorKind::InvalidEventEnvelope,
        PipelineError::Envelope(EnvelopeError::Invalid { .. }) => ErrorKind::InvalidEventEnvelope,
        PipelineError::Envelope(EnvelopeError::UnsupportedEventType(_))
        | PipelineError::Envelope(EnvelopeError::UnsupportedEventClass { .. }) => {
            ErrorKind::UnsupportedEvent
        }
        PipelineError::Envelope(EnvelopeError::SchemaNotFound(_)) => ErrorKind::SchemaNotFound,
        PipelineError::Handler(HandlerError::Rejected(_)) => ErrorKind::InvalidInput,
        PipelineError::Store(e) if !e.is_transient() => ErrorKind::Internal,
        PipelineError::Store(_) | PipelineError::Handler(HandlerError::Transient(_)) => {
            ErrorKind::Transient
        }
    };
    ApiError::new(kind, error.to_string())
}
