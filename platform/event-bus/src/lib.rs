//! # Event Bus
//!
//! Platform-level event contract and transport.
//!
//! - [`EventEnvelope`] / [`codec`]: the canonical envelope and its JSON wire form
//! - [`validator`]: the ordered contract checks every envelope passes before use
//! - [`EventBus`]: publish/subscribe abstraction with NATS and in-memory backends
//! - [`consumer_retry`]: bounded backoff shared by consumers and the relay
//! - [`store`]: error and lifecycle types shared by the durable stores
//! - [`ShutdownSignal`]: cooperative shutdown for long-running tasks
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{BusMessage, EventBus, EventClass, EventEnvelope, InMemoryBus};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//!
//! let envelope = EventEnvelope::builder("thing.created", "smoke-test")
//!     .class(EventClass::Domain)
//!     .partition_by_data("id")
//!     .data(serde_json::json!({"id": "t-1"}))
//!     .build()?;
//!
//! bus.publish(BusMessage::from_envelope(&envelope)?).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod consumer_retry;
mod envelope;
mod inmemory_bus;
mod nats_bus;
pub mod schema_registry;
mod shutdown;
pub mod store;
pub mod validator;

pub use codec::{decode, encode, CodecError};
pub use envelope::{
    EnvelopeBuilder, EventClass, EventData, EventEnvelope, EventFormat, DATA_PATH_PREFIX,
    SOURCE_SERVICE_PATH,
};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;
pub use schema_registry::{InMemorySchemaRegistry, SchemaRegistry};
pub use shutdown::{ShutdownSignal, DEFAULT_GRACE_PERIOD};
pub use store::{expires_at, LifecycleState, StoreError, StoreLifecycle};
pub use validator::{EnvelopeError, EnvelopeValidator, InvalidReason, ValidationPolicy};

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Header carrying the event id; JetStream uses it for duplicate suppression.
pub const HEADER_MSG_ID: &str = "Nats-Msg-Id";
pub const HEADER_TRACE_ID: &str = "trace-id";
pub const HEADER_EVENT_TYPE: &str = "event-type";

/// Subject an envelope is published on: `{source_service}.events.{event_type}`.
pub fn subject_for(envelope: &EventEnvelope) -> String {
    format!("{}.events.{}", envelope.source_service(), envelope.event_type())
}

/// A message on the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Option<HashMap<String, String>>,
    pub reply_to: Option<String>,
}

impl BusMessage {
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            reply_to: None,
        }
    }

    /// Encode an envelope onto its canonical subject, with id, trace and type headers.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, CodecError> {
        let payload = codec::encode(envelope)?;
        let mut headers = HashMap::new();
        headers.insert(HEADER_MSG_ID.to_string(), envelope.event_id().to_string());
        headers.insert(HEADER_TRACE_ID.to_string(), envelope.trace_id().to_string());
        headers.insert(HEADER_EVENT_TYPE.to_string(), envelope.event_type().to_string());
        Ok(Self::new(subject_for(envelope), payload).with_headers(headers))
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.as_ref()?.get(name).map(String::as_str)
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<CodecError> for BusError {
    fn from(e: CodecError) -> Self {
        BusError::SerializationError(e.to_string())
    }
}

pub type BusResult<T> = Result<T, BusError>;

/// Publish/subscribe transport
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message. `Ok` means the broker accepted it.
    async fn publish(&self, message: BusMessage) -> BusResult<()>;

    /// Subscribe to subjects matching `subject` (`*` one token, `>` the rest).
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_from_envelope_carries_headers() {
        let envelope = EventEnvelope::builder("thing.created", "smoke-test")
            .event_id("evt-1")
            .trace_id("trace-1")
            .partition_by_data("id")
            .data(json!({"id": "t-1"}))
            .build()
            .unwrap();

        let msg = BusMessage::from_envelope(&envelope).unwrap();
        assert_eq!(msg.subject, "smoke-test.events.thing.created");
        assert_eq!(msg.header(HEADER_MSG_ID), Some("evt-1"));
        assert_eq!(msg.header(HEADER_TRACE_ID), Some("trace-1"));
        assert_eq!(msg.header(HEADER_EVENT_TYPE), Some("thing.created"));

        let decoded = decode(&msg.payload).unwrap();
        assert_eq!(decoded, envelope);
    }
}
