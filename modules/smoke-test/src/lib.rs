//! # Smoke Test
//!
//! Smallest module wired onto the integrity substrate:
//!
//! - `POST /api/things` creates a thing under an `Idempotency-Key` and
//!   enqueues `thing.created` in the same atomic unit
//! - the outbox relay publishes it to the bus
//! - `thing.renamed` arrives over the bus (or `POST /api/events`) and goes
//!   through the deduplicating inbound pipeline; failures land in the DLQ

pub mod config;
pub mod events;
pub mod models;
pub mod repo;
pub mod routes;
pub mod sweeper;

pub use config::Config;
pub use events::{build_pipeline, RenameThingHandler, SERVICE_NAME};
pub use models::Thing;
pub use repo::{MemoryThingStore, PgThingStore, ThingError, ThingStore};
pub use routes::{router, AppState};
pub use sweeper::Sweeper;
