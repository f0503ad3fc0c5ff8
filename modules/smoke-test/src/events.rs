//! Events this module emits and consumes

use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;
use config_validator::IntegrityConfig;
use event_bus::{CodecError, EventClass, EventEnvelope, SchemaRegistry};
use event_consumer::{DedupStore, EventHandler, HandlerError, HandlerPolicy, InboundPipeline};

use crate::models::{Thing, ThingCreatedPayload, ThingRenamedPayload};
use crate::repo::{ThingError, ThingStore};

pub const SERVICE_NAME: &str = "smoke-test";
pub const CONSUMER_GROUP: &str = "smoke-test";

pub const THING_CREATED: &str = "thing.created";
pub const THING_RENAMED: &str = "thing.renamed";

/// Every producer's `thing.renamed`.
pub const THING_RENAMED_SUBJECT: &str = "*.events.thing.renamed";

/// Domain event announcing a new thing, keyed by its id.
pub fn thing_created(thing: &Thing, trace_id: Option<&str>) -> Result<EventEnvelope, CodecError> {
    let payload = ThingCreatedPayload {
        id: thing.id.clone(),
        name: thing.name.clone(),
        created_by: thing.created_by.clone(),
    };
    let mut builder = EventEnvelope::builder(THING_CREATED, SERVICE_NAME)
        .class(EventClass::Domain)
        .occurred_at(thing.created_at)
        .partition_by_data("id")
        .payload(&payload)?;
    if let Some(trace_id) = trace_id {
        builder = builder.trace_id(trace_id);
    }
    builder.build()
}

impl From<ThingError> for HandlerError {
    fn from(e: ThingError) -> Self {
        match e {
            ThingError::Store(err) => err.into(),
            other => HandlerError::Rejected(other.to_string()),
        }
    }
}

/// Applies upstream renames. Renaming to the current name is harmless, so a
/// redelivery that slips past dedup does no damage.
pub struct RenameThingHandler {
    store: Arc<dyn ThingStore>,
}

impl RenameThingHandler {
    pub fn new(store: Arc<dyn ThingStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for RenameThingHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let payload: ThingRenamedPayload = envelope.data().parse()?;
        let thing = self.store.rename(&payload.id, &payload.name).await?;
        tracing::info!(thing_id = %thing.id, name = %thing.name, "thing renamed");
        Ok(())
    }
}

/// Inbound pipeline with every handler this module binds.
pub fn build_pipeline(
    store: Arc<dyn ThingStore>,
    dedup: Arc<dyn DedupStore>,
    config: &IntegrityConfig,
    registry: Option<Arc<dyn SchemaRegistry>>,
) -> InboundPipeline {
    let mut pipeline = InboundPipeline::new(dedup)
        .with_dedup_ttl(TimeDelta::from_std(config.event_dedup_ttl()).unwrap_or(TimeDelta::MAX))
        .with_clock_skew(TimeDelta::from_std(config.clock_skew()).unwrap_or(TimeDelta::MAX));
    if let Some(registry) = registry {
        pipeline = pipeline.with_registry(registry);
    }
    pipeline.register(
        THING_RENAMED,
        HandlerPolicy::domain().partition_paths(["data.id"]),
        Arc::new(RenameThingHandler::new(store)),
    )
}
