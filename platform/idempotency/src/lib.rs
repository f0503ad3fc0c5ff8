//! # Idempotency
//!
//! At-most-once effect for mutating HTTP requests under a client-supplied
//! `Idempotency-Key`, with replay of the original response.

mod guard;
pub mod hash;
pub mod middleware;
mod store;

pub use guard::ReservationGuard;
pub use hash::{canonical_json, request_hash};
pub use middleware::{
    idempotency_middleware, Idempotency, KeyShape, IDEMPOTENCY_KEY_HEADER, IDEMPOTENT_REPLAY_HEADER,
};
pub use store::{
    IdempotencyRecord, IdempotencyStore, InMemoryIdempotencyStore, PgIdempotencyStore,
    ReserveOutcome, DEFAULT_IDEMPOTENCY_TTL_HOURS,
};

use event_bus::StoreError;
use platform_http_contracts::{ApiError, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("Idempotency-Key header is required")]
    KeyRequired,

    #[error("{0}")]
    InvalidKey(String),

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("idempotency key was already used with a different request")]
    Conflict,

    #[error("a request with this idempotency key is still in progress")]
    InFlight,

    #[error(transparent)]
    Auth(ApiError),

    #[error("idempotency store error: {0}")]
    Store(#[from] StoreError),
}

impl From<IdempotencyError> for ApiError {
    fn from(e: IdempotencyError) -> Self {
        let message = e.to_string();
        match e {
            IdempotencyError::KeyRequired => {
                ApiError::new(ErrorKind::IdempotencyKeyRequired, message)
            }
            IdempotencyError::InvalidKey(_) | IdempotencyError::InvalidBody(_) => {
                ApiError::invalid_input(message)
            }
            IdempotencyError::Conflict => ApiError::new(ErrorKind::IdempotencyConflict, message),
            IdempotencyError::InFlight => ApiError::new(ErrorKind::IdempotencyInFlight, message),
            IdempotencyError::Auth(err) => err,
            IdempotencyError::Store(err) if err.is_transient() => ApiError::transient(message),
            IdempotencyError::Store(_) => ApiError::internal(message),
        }
    }
}
