//! # Control Plane
//!
//! Operator surface for failed deliveries:
//!
//! - `GET  /api/dlq`         filtered listing, newest first
//! - `GET  /api/dlq/{id}`    one record
//! - `POST /api/dlq/replay`  idempotent bulk replay (role `operator`)
//! - `GET  /api/health`

pub mod controller;
pub mod http;

pub use controller::{ControllerError, DlqController, ReplayFailure, ReplayFilter, ReplayReport};
pub use http::{router, AppState, OPERATOR_ROLE};
