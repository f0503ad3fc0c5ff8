use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use dlq::{DlqQuery, DlqRecord};
use idempotency::{idempotency_middleware, Idempotency, KeyShape};
use platform_http_contracts::{request_id_middleware, Actor, ApiError, SuccessEnvelope};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::controller::{DlqController, ReplayFilter, ReplayReport};

/// Role allowed to replay dead-lettered events.
pub const OPERATOR_ROLE: &str = "operator";

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<DlqController>,
}

pub fn router(controller: Arc<DlqController>, idempotency: Idempotency) -> Router {
    let state = AppState { controller };

    let replay = Router::new()
        .route("/api/dlq/replay", post(replay_dlq))
        .route_layer(middleware::from_fn_with_state(
            idempotency.with_key_shape(KeyShape::structured().op("replay").entity("dlq")),
            idempotency_middleware,
        ));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/dlq", get(list_dlq))
        .route("/api/dlq/{id}", get(get_dlq))
        .merge(replay)
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
        "service": "control-plane",
        "status": "ok",
        "dlq_store": format!("{:?}", state.controller.store().lifecycle().state()),
    }))
}

async fn list_dlq(
    State(state): State<AppState>,
    _actor: Actor,
    Query(query): Query<DlqQuery>,
) -> Result<SuccessEnvelope<Vec<DlqRecord>>, ApiError> {
    let records = state.controller.query(&query).await?;
    Ok(SuccessEnvelope::new(records))
}

async fn get_dlq(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<SuccessEnvelope<DlqRecord>, ApiError> {
    let record = state.controller.get(id).await?;
    Ok(SuccessEnvelope::new(record))
}

async fn replay_dlq(
    State(state): State<AppState>,
    actor: Actor,
    Json(filter): Json<ReplayFilter>,
) -> Result<SuccessEnvelope<ReplayReport>, ApiError> {
    actor.require_role(OPERATOR_ROLE)?;
    tracing::info!(subject = %actor.subject, filter = ?filter, "DLQ replay requested");

    let report = state.controller.replay(&filter).await?;
    let message = format!("replayed {} of {} records", report.replayed, report.requested);
    Ok(SuccessEnvelope::new(report).with_message(message))
}
