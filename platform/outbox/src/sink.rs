//! Destinations the relay publishes to.

use std::sync::Arc;

use async_trait::async_trait;
use event_bus::{BusError, BusMessage, EventBus, EventEnvelope};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink rejected event: {0}")]
    Rejected(String),
}

impl From<BusError> for SinkError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::SerializationError(msg) => SinkError::Rejected(msg),
            other => SinkError::Unavailable(other.to_string()),
        }
    }
}

/// Durable, at-least-once destination for domain events.
#[async_trait]
pub trait DomainSink: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), SinkError>;
}

/// Best-effort destination for analytics (and, by default, ops) events.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), SinkError>;
}

/// Publishes envelopes on `{source_service}.events.{event_type}`.
#[derive(Clone)]
pub struct BusSink {
    bus: Arc<dyn EventBus>,
}

impl BusSink {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    async fn send(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        let message =
            BusMessage::from_envelope(envelope).map_err(|e| SinkError::Rejected(e.to_string()))?;
        let subject = message.subject.clone();
        self.bus.publish(message).await?;
        tracing::debug!(event_id = %envelope.event_id(), subject = %subject, "event published");
        Ok(())
    }
}

#[async_trait]
impl DomainSink for BusSink {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        self.send(envelope).await
    }
}

#[async_trait]
impl AnalyticsSink for BusSink {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        self.send(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::{EventClass, InMemoryBus};
    use serde_json::json;

    #[tokio::test]
    async fn test_bus_sink_publishes_on_canonical_subject() {
        let bus = Arc::new(InMemoryBus::new());
        let sink = BusSink::new(bus.clone());
        let envelope = EventEnvelope::builder("thing.created", "smoke-test")
            .class(EventClass::Domain)
            .partition_by_data("id")
            .data(json!({"id": "t-1"}))
            .build()
            .unwrap();

        DomainSink::publish(&sink, &envelope).await.unwrap();
        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject, "smoke-test.events.thing.created");

        bus.set_offline(true);
        let err = AnalyticsSink::publish(&sink, &envelope).await.unwrap_err();
        assert!(matches!(err, SinkError::Unavailable(_)));
    }
}
