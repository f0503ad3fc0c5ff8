//! Inbound pipeline
//!
//! One envelope at a time: validate against the handler's policy, skip if
//! already processed, dispatch to the handler bound to its `event_type`, then
//! remember the `event_id`. A failed handler leaves no dedup mark so the
//! consumer can retry or dead-letter it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use event_bus::validator::validate_envelope;
use event_bus::{
    codec, expires_at, CodecError, EnvelopeError, EventClass, EventEnvelope, SchemaRegistry,
    StoreError, ValidationPolicy,
};
use tracing::{debug, info};

use crate::dedup::{DedupStore, DEFAULT_DEDUP_TTL_HOURS};

/// Failure reported by an event handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Payload can never be applied (bad business data); goes straight to the DLQ.
    #[error("event rejected: {0}")]
    Rejected(String),

    /// Temporary failure (store, upstream); retried.
    #[error("handler failed: {0}")]
    Transient(String),
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        if e.is_transient() {
            HandlerError::Transient(e.to_string())
        } else {
            HandlerError::Rejected(e.to_string())
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::Rejected(format!("payload does not match handler schema: {e}"))
    }
}

/// Business handler bound to one event type.
///
/// Handlers run their business writes and any outbox enqueue in a single
/// atomic unit. They must not consume their own emissions synchronously.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// What a handler accepts beyond its event type.
#[derive(Debug, Clone, Default)]
pub struct HandlerPolicy {
    pub expected_class: Option<EventClass>,
    pub partition_paths: Option<Vec<String>>,
    pub accept_legacy_paths: bool,
}

impl HandlerPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn domain() -> Self {
        Self::new().expect_class(EventClass::Domain)
    }

    pub fn expect_class(mut self, class: EventClass) -> Self {
        self.expected_class = Some(class);
        self
    }

    pub fn partition_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn accept_legacy_paths(mut self) -> Self {
        self.accept_legacy_paths = true;
        self
    }
}

/// Why an envelope was not processed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid event envelope: {0}")]
    Decode(#[from] CodecError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("dedup store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl PipelineError {
    /// Terminal errors are dead-lettered without further attempts.
    pub fn is_terminal(&self) -> bool {
        match self {
            PipelineError::Decode(_) | PipelineError::Envelope(_) => true,
            PipelineError::Store(e) => !e.is_transient(),
            PipelineError::Handler(HandlerError::Rejected(_)) => true,
            PipelineError::Handler(HandlerError::Transient(_)) => false,
        }
    }

    /// Machine-readable code, recorded as the DLQ `error_type`.
    pub fn reason(&self) -> &'static str {
        match self {
            PipelineError::Decode(_) => "invalid_event_envelope",
            PipelineError::Envelope(e) => e.reason(),
            PipelineError::Store(_) => "store_unavailable",
            PipelineError::Handler(HandlerError::Rejected(_)) => "handler_rejected",
            PipelineError::Handler(HandlerError::Transient(_)) => "handler_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed,
    Duplicate,
}

struct Registration {
    policy: ValidationPolicy,
    handler: Arc<dyn EventHandler>,
}

/// Validating, deduplicating dispatcher keyed by `event_type`.
pub struct InboundPipeline {
    handlers: HashMap<String, Registration>,
    base_policy: ValidationPolicy,
    dedup: Arc<dyn DedupStore>,
    dedup_ttl: Duration,
    registry: Option<Arc<dyn SchemaRegistry>>,
}

impl InboundPipeline {
    pub fn new(dedup: Arc<dyn DedupStore>) -> Self {
        Self {
            handlers: HashMap::new(),
            base_policy: ValidationPolicy::default(),
            dedup,
            dedup_ttl: Duration::hours(DEFAULT_DEDUP_TTL_HOURS),
            registry: None,
        }
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.base_policy.max_clock_skew = skew;
        for registration in self.handlers.values_mut() {
            registration.policy.max_clock_skew = skew;
        }
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Bind `handler` to `event_type`. A later registration for the same type
    /// replaces the earlier one.
    pub fn register(
        mut self,
        event_type: impl Into<String>,
        policy: HandlerPolicy,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let event_type = event_type.into();
        let mut validation = self.base_policy.clone().allow_types([event_type.clone()]);
        validation.expected_class = policy.expected_class;
        validation.allowed_partition_paths = policy.partition_paths;
        validation.accept_legacy_paths = policy.accept_legacy_paths;

        self.handlers.insert(
            event_type,
            Registration {
                policy: validation,
                handler,
            },
        );
        self
    }

    pub fn event_types(&self) -> BTreeSet<String> {
        self.handlers.keys().cloned().collect()
    }

    fn registration_for(&self, envelope: &EventEnvelope) -> Option<&Registration> {
        self.handlers.get(envelope.event_type()).or_else(|| {
            envelope
                .canonical_event()
                .and_then(|alias| self.handlers.get(alias))
        })
    }

    /// Decode then process raw envelope bytes.
    pub async fn process_bytes(
        &self,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, PipelineError> {
        let envelope = codec::decode(bytes)?;
        self.process(&envelope, now).await
    }

    pub async fn process(
        &self,
        envelope: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, PipelineError> {
        let registry = self.registry.as_deref();
        let event_id = envelope.event_id();
        let event_type = envelope.event_type();

        let registration = match self.registration_for(envelope) {
            Some(registration) => registration,
            None => {
                // Unknown types still go through presence and shape checks first
                let policy = self.base_policy.clone().allow_types(self.event_types());
                validate_envelope(envelope, &policy, now, registry)?;
                return Err(EnvelopeError::UnsupportedEventType(event_type.to_string()).into());
            }
        };

        validate_envelope(envelope, &registration.policy, now, registry)?;

        if self.dedup.is_duplicate(event_id, now).await? {
            info!(event_id = %event_id, event_type = %event_type, "duplicate event skipped");
            return Ok(ProcessOutcome::Duplicate);
        }

        registration.handler.handle(envelope).await?;

        self.dedup
            .mark_processed(event_id, event_type, expires_at(now, self.dedup_ttl))
            .await?;

        debug!(event_id = %event_id, event_type = %event_type, "event processed");
        Ok(ProcessOutcome::Processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::InMemoryDedupStore;
    use event_bus::InMemorySchemaRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicU32,
        fail_with: Option<fn() -> HandlerError>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    fn envelope(event_id: &str, event_type: &str, partition_key: &str) -> EventEnvelope {
        EventEnvelope::builder(event_type, "upstream")
            .event_id(event_id)
            .class(EventClass::Domain)
            .partition("data.id", partition_key)
            .data(json!({"id": "alpha"}))
            .build()
            .unwrap()
    }

    fn pipeline_with(
        handler: Arc<CountingHandler>,
        dedup: Arc<InMemoryDedupStore>,
    ) -> InboundPipeline {
        InboundPipeline::new(dedup).register(
            "x.created",
            HandlerPolicy::domain().partition_paths(["data.id"]),
            handler,
        )
    }

    #[tokio::test]
    async fn test_fresh_event_is_handled_and_marked() {
        let handler = Arc::new(CountingHandler::default());
        let dedup = Arc::new(InMemoryDedupStore::new());
        let pipeline = pipeline_with(handler.clone(), dedup.clone());
        let now = Utc::now();

        let outcome = pipeline.process(&envelope("e-1", "x.created", "alpha"), now).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.get("e-1").unwrap().expires_at, now + Duration::hours(168));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_skips_handler() {
        let handler = Arc::new(CountingHandler::default());
        let dedup = Arc::new(InMemoryDedupStore::new());
        let pipeline = pipeline_with(handler.clone(), dedup.clone());
        let env = envelope("e-1", "x.created", "alpha");

        pipeline.process(&env, Utc::now()).await.unwrap();
        let outcome = pipeline.process(&env, Utc::now()).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Duplicate);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partition_mismatch_rejected_before_dedup_and_handler() {
        let handler = Arc::new(CountingHandler::default());
        let dedup = Arc::new(InMemoryDedupStore::new());
        let pipeline = pipeline_with(handler.clone(), dedup.clone());

        let err = pipeline
            .process(&envelope("e-1", "x.created", "mismatch"), Utc::now())
            .await
            .unwrap_err();

        assert!(err.is_terminal());
        assert_eq!(err.reason(), "partition_key_mismatch");
        assert!(dedup.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unregistered_type_is_unsupported() {
        let handler = Arc::new(CountingHandler::default());
        let pipeline = pipeline_with(handler, Arc::new(InMemoryDedupStore::new()));

        let err = pipeline
            .process(&envelope("e-1", "y.created", "alpha"), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "unsupported_event_type");
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_malformed_shape_reported_before_unsupported_type() {
        let pipeline = pipeline_with(
            Arc::new(CountingHandler::default()),
            Arc::new(InMemoryDedupStore::new()),
        );
        let err = pipeline
            .process(&envelope("e-1", "Bad.Type", "alpha"), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_event_type");
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_no_mark() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_with: Some(|| HandlerError::Transient("db down".into())),
        });
        let dedup = Arc::new(InMemoryDedupStore::new());
        let pipeline = pipeline_with(handler, dedup.clone());

        let err = pipeline
            .process(&envelope("e-1", "x.created", "alpha"), Utc::now())
            .await
            .unwrap_err();
        assert!(!err.is_terminal());
        assert_eq!(err.reason(), "handler_failed");
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_avro_without_schema_is_terminal() {
        let registry = Arc::new(InMemorySchemaRegistry::new());
        let pipeline = InboundPipeline::new(Arc::new(InMemoryDedupStore::new()))
            .with_registry(registry)
            .register("y.created", HandlerPolicy::domain(), Arc::new(CountingHandler::default()));

        let env = EventEnvelope::builder("y.created", "upstream")
            .class(EventClass::Domain)
            .format(event_bus::EventFormat::Avro)
            .partition_by_data("id")
            .data(json!({"id": "alpha"}))
            .build()
            .unwrap();

        let err = pipeline.process(&env, Utc::now()).await.unwrap_err();
        assert_eq!(err.reason(), "schema_not_found");
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_process_bytes_rejects_malformed_json() {
        let pipeline = pipeline_with(
            Arc::new(CountingHandler::default()),
            Arc::new(InMemoryDedupStore::new()),
        );
        let err = pipeline.process_bytes(b"not json", Utc::now()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
        assert_eq!(err.reason(), "invalid_event_envelope");
    }

    #[tokio::test]
    async fn test_canonical_alias_routes_to_handler() {
        let handler = Arc::new(CountingHandler::default());
        let pipeline = InboundPipeline::new(Arc::new(InMemoryDedupStore::new())).register(
            "payout.created",
            HandlerPolicy::domain(),
            handler.clone(),
        );

        let env = EventEnvelope::builder("payouts.created", "upstream")
            .class(EventClass::Domain)
            .canonical_event("payout.created")
            .partition_by_data("id")
            .data(json!({"id": "p-1"}))
            .build()
            .unwrap();

        assert_eq!(pipeline.process(&env, Utc::now()).await.unwrap(), ProcessOutcome::Processed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
