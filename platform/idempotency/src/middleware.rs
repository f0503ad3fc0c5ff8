//! `Idempotency-Key` enforcement for mutating routes
//!
//! ```text
//! POST/PUT/PATCH/DELETE
//!   → key present, 1..=256 chars, matches the route's KeyShape
//!   → reserve(subject/key, sha256(canonical request))
//!        Reserved         → run handler → 2xx: complete | otherwise: release
//!        AlreadyReserved  → completed: replay status + body | else 409 in flight
//!        Conflict         → 409 idempotency_conflict
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use event_bus::expires_at;
use platform_http_contracts::{Actor, ApiError};

use crate::guard::ReservationGuard;
use crate::hash::request_hash;
use crate::store::{IdempotencyStore, ReserveOutcome};
use crate::IdempotencyError;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
/// Set to `true` on responses served from the cache.
pub const IDEMPOTENT_REPLAY_HEADER: &str = "idempotent-replay";
pub const MAX_KEY_LEN: usize = 256;
pub const DEFAULT_IN_FLIGHT_SECONDS: u64 = 60;
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Structured key format `{op}:{entity}:{salt}`, optionally pinned per route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyShape {
    op: Option<String>,
    entity: Option<String>,
}

impl KeyShape {
    /// Any `{op}:{entity}:{salt}` with three non-empty segments.
    pub fn structured() -> Self {
        Self::default()
    }

    pub fn op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn check(&self, key: &str) -> Result<(), String> {
        let parts: Vec<&str> = key.splitn(3, ':').collect();
        let [op, entity, salt] = parts.as_slice() else {
            return Err("expected {op}:{entity}:{salt}".to_string());
        };
        if op.is_empty() || entity.is_empty() || salt.is_empty() {
            return Err("key segments must be non-empty".to_string());
        }
        if let Some(expected) = &self.op {
            if *op != expected.as_str() {
                return Err(format!("op must be '{expected}'"));
            }
        }
        if let Some(expected) = &self.entity {
            if *entity != expected.as_str() {
                return Err(format!("entity must be '{expected}'"));
            }
        }
        Ok(())
    }
}

/// State for [`idempotency_middleware`]; one per route group.
#[derive(Clone)]
pub struct Idempotency {
    store: Arc<dyn IdempotencyStore>,
    in_flight: Duration,
    key_shape: Option<KeyShape>,
}

impl Idempotency {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            in_flight: Duration::from_secs(DEFAULT_IN_FLIGHT_SECONDS),
            key_shape: None,
        }
    }

    /// Lease on an uncompleted reservation; a crashed handler frees the key
    /// after this long.
    pub fn with_in_flight(mut self, in_flight: Duration) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn with_key_shape(mut self, shape: KeyShape) -> Self {
        self.key_shape = Some(shape);
        self
    }

    fn validate_key(&self, key: &str) -> Result<(), IdempotencyError> {
        if key.is_empty() || key.chars().count() > MAX_KEY_LEN {
            return Err(IdempotencyError::InvalidKey(format!(
                "Idempotency-Key must be 1..={MAX_KEY_LEN} characters"
            )));
        }
        if let Some(shape) = &self.key_shape {
            shape
                .check(key)
                .map_err(|reason| {
                    IdempotencyError::InvalidKey(format!("Idempotency-Key {reason}"))
                })?;
        }
        Ok(())
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

pub async fn idempotency_middleware(
    State(idem): State<Idempotency>,
    request: Request,
    next: Next,
) -> Response {
    if !is_mutating(request.method()) {
        return next.run(request).await;
    }
    match run_idempotent(&idem, request, next).await {
        Ok(response) => response,
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn run_idempotent(
    idem: &Idempotency,
    request: Request,
    next: Next,
) -> Result<Response, IdempotencyError> {
    let key = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .ok_or(IdempotencyError::KeyRequired)?
        .to_string();
    idem.validate_key(&key)?;

    let actor = Actor::from_headers(request.headers()).map_err(IdempotencyError::Auth)?;
    let scoped_key = format!("{}/{}", actor.subject, key);

    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| IdempotencyError::InvalidBody(e.to_string()))?;
    let hash = request_hash(parts.method.as_str(), parts.uri.path(), &bytes);

    let now = Utc::now();
    let lease = chrono::Duration::from_std(idem.in_flight)
        .unwrap_or_else(|_| chrono::Duration::seconds(60));
    let outcome = idem.store.reserve(&scoped_key, &hash, now, expires_at(now, lease)).await?;

    match outcome {
        ReserveOutcome::Reserved => {}
        ReserveOutcome::AlreadyReserved(record) => {
            let (Some(code), Some(body)) = (record.response_code, record.response_body) else {
                return Err(IdempotencyError::InFlight);
            };
            tracing::info!(
                key = %key,
                subject = %actor.subject,
                status = code,
                "replaying idempotent response"
            );
            return Ok(replay(code, body));
        }
        ReserveOutcome::Conflict(_) => {
            tracing::warn!(
                key = %key,
                subject = %actor.subject,
                "idempotency key reused with a different request"
            );
            return Err(IdempotencyError::Conflict);
        }
    }

    let guard = ReservationGuard::new(idem.store.clone(), scoped_key);
    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;

    if !response.status().is_success() {
        if let Err(e) = guard.release().await {
            tracing::warn!(key = %key, error = %e, "failed to release idempotency key");
        }
        return Ok(response);
    }

    let (res_parts, res_body) = response.into_parts();
    let res_bytes = match to_bytes(res_body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            drop(guard);
            return Err(IdempotencyError::InvalidBody(format!("failed to buffer response: {e}")));
        }
    };

    if let Err(e) = guard
        .complete(res_parts.status.as_u16(), res_bytes.to_vec(), Utc::now())
        .await
    {
        tracing::warn!(key = %key, error = %e, "failed to record idempotent response");
    }

    Ok(Response::from_parts(res_parts, Body::from(res_bytes)))
}

fn replay(code: u16, body: Vec<u8>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(IDEMPOTENT_REPLAY_HEADER, HeaderValue::from_static("true"));
    response
}
