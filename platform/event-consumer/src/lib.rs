//! # Event Consumer
//!
//! Inbound side of the event contract.
//!
//! - [`dedup`]: remembers processed event ids for the dedup window
//! - [`pipeline`]: validate → dedup → dispatch → mark, one envelope at a time
//! - [`consumer`]: bus subscription task with retry and DLQ routing

pub mod consumer;
pub mod dedup;
pub mod pipeline;

pub use consumer::{run_consumer, spawn_consumer, ConsumerConfig, ConsumerStats};
pub use dedup::{DedupRecord, DedupStore, InMemoryDedupStore, PgDedupStore, DEFAULT_DEDUP_TTL_HOURS};
pub use pipeline::{
    EventHandler, HandlerError, HandlerPolicy, InboundPipeline, PipelineError, ProcessOutcome,
};
