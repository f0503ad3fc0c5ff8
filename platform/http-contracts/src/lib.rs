//! Shared HTTP contracts
//!
//! Every service answers with the same two envelopes:
//!
//! ```json
//! {"status":"success","message":"optional","data":{}}
//! {"status":"error","error":{"code":"not_found","message":"...","request_id":"..."}}
//! ```
//!
//! Enable the `axum` feature for `IntoResponse`, the [`Actor`] and
//! [`RequestId`] extractors and [`request_id_middleware`].

mod error;
mod success;
#[cfg(feature = "axum")]
mod web;

pub use error::{ApiError, ErrorBody, ErrorEnvelope, ErrorKind};
pub use success::SuccessEnvelope;
#[cfg(feature = "axum")]
pub use web::{
    request_id_middleware, Actor, RequestId, ACTOR_ROLE_HEADER, DEFAULT_ACTOR_ROLE,
    REQUEST_ID_HEADER,
};
