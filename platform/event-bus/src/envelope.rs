//! # Canonical Event Envelope
//!
//! Platform-wide wire contract for every event that crosses a service
//! boundary, whether it is produced through an outbox or consumed from the
//! broker.
//!
//! ## Envelope Fields
//!
//! - `event_id`: Opaque unique identifier (UUID v4 when issued by the platform)
//! - `event_type`: Lowercase dotted identifier, `domain.action` or `domain.subject.action`
//! - `event_class`: Routing/durability tier (`domain`, `analytics_only`, `ops`)
//! - `occurred_at`: RFC 3339 timestamp when the event was generated
//! - `partition_key_path` / `partition_key`: Where the partition key lives and its
//!   materialized value
//! - `source_service`: Logical producer identifier
//! - `trace_id`: Distributed tracing identifier
//! - `schema_version`: Payload schema version
//! - `canonical_event`: Canonical alias, required for deprecated plural domains
//! - `format`: Payload encoding (`json` or `avro`)
//! - `data`: Event-specific payload
//!
//! Envelopes are immutable once built. Producers go through
//! [`EventEnvelope::builder`]; consumers go through [`crate::codec::decode`].

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::codec::{CodecError, WireEnvelope};

/// Partition path that keys an event by its producer.
pub const SOURCE_SERVICE_PATH: &str = "envelope.source_service";

/// Prefix of partition paths that address a payload field.
pub const DATA_PATH_PREFIX: &str = "data.";

/// Routing and durability tier of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    /// Durable, at-least-once, DLQ-backed
    Domain,
    /// Best-effort
    AnalyticsOnly,
    /// Audit events keyed by source service
    Ops,
}

impl EventClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::Domain => "domain",
            EventClass::AnalyticsOnly => "analytics_only",
            EventClass::Ops => "ops",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventClass {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "domain" => Ok(EventClass::Domain),
            "analytics_only" => Ok(EventClass::AnalyticsOnly),
            "ops" => Ok(EventClass::Ops),
            other => Err(CodecError::UnknownEventClass(other.to_string())),
        }
    }
}

/// Payload encoding declared by the envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFormat {
    #[default]
    Json,
    Avro,
}

impl EventFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventFormat::Json => "json",
            EventFormat::Avro => "avro",
        }
    }
}

impl fmt::Display for EventFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(EventFormat::Json),
            "avro" => Ok(EventFormat::Avro),
            other => Err(CodecError::UnknownFormat(other.to_string())),
        }
    }
}

/// Event payload: the raw JSON object exactly as received, plus a lazily
/// parsed key → value view used for partition-key extraction.
pub struct EventData {
    raw: Box<RawValue>,
    view: OnceLock<Option<Map<String, Value>>>,
}

impl EventData {
    /// Wrap raw payload text. The text must be a JSON object.
    pub fn from_raw(raw: Box<RawValue>) -> Result<Self, CodecError> {
        let text = raw.get().trim_start();
        if text.starts_with("null") {
            return Err(CodecError::NullData);
        }
        if !text.starts_with('{') {
            return Err(CodecError::DataNotObject);
        }
        Ok(Self {
            raw,
            view: OnceLock::new(),
        })
    }

    /// Build a payload from a JSON value. Only objects are accepted.
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Null => Err(CodecError::NullData),
            Value::Object(_) => {
                let raw = serde_json::value::to_raw_value(value).map_err(CodecError::Encode)?;
                Self::from_raw(raw)
            }
            _ => Err(CodecError::DataNotObject),
        }
    }

    /// Serialize any payload struct into event data.
    pub fn from_serializable<T: Serialize>(payload: &T) -> Result<Self, CodecError> {
        let value = serde_json::to_value(payload).map_err(CodecError::Encode)?;
        Self::from_value(&value)
    }

    /// Raw payload bytes as they appear on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        self.raw.get().as_bytes()
    }

    pub fn as_str(&self) -> &str {
        self.raw.get()
    }

    fn view(&self) -> Option<&Map<String, Value>> {
        self.view
            .get_or_init(|| serde_json::from_str::<Map<String, Value>>(self.raw.get()).ok())
            .as_ref()
    }

    /// Look up a top-level payload field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.view().and_then(|map| map.get(field))
    }

    /// Top-level payload field rendered as a trimmed string.
    ///
    /// Strings, numbers and booleans are materialized; objects, arrays and
    /// nulls have no string form and yield `None`.
    pub fn get_str(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// True when the payload object has no fields.
    pub fn is_empty(&self) -> bool {
        self.view().map(|m| m.is_empty()).unwrap_or(true)
    }

    pub fn to_value(&self) -> Value {
        self.view()
            .map(|m| Value::Object(m.clone()))
            .unwrap_or(Value::Null)
    }

    /// Deserialize the payload into a typed struct.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.raw.get())
    }
}

impl Clone for EventData {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            view: self.view.clone(),
        }
    }
}

impl PartialEq for EventData {
    fn eq(&self, other: &Self) -> bool {
        self.raw.get() == other.raw.get()
    }
}

impl Eq for EventData {}

impl fmt::Debug for EventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventData").field(&self.raw.get()).finish()
    }
}

impl Serialize for EventData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

/// Canonical event envelope.
///
/// # Examples
///
/// ```rust
/// use event_bus::{EventClass, EventEnvelope};
/// use serde_json::json;
///
/// let envelope = EventEnvelope::builder("thing.created", "smoke-test")
///     .class(EventClass::Domain)
///     .trace_id("trace-1")
///     .partition_by_data("id")
///     .data(json!({"id": "t-1", "name": "a"}))
///     .build()
///     .unwrap();
///
/// assert_eq!(envelope.partition_key(), "t-1");
/// assert_eq!(envelope.partition_key_path(), "data.id");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct EventEnvelope {
    pub(crate) event_id: String,
    pub(crate) event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) event_class: Option<EventClass>,
    pub(crate) occurred_at: DateTime<Utc>,
    pub(crate) partition_key_path: String,
    pub(crate) partition_key: String,
    pub(crate) source_service: String,
    pub(crate) trace_id: String,
    pub(crate) schema_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) canonical_event: Option<String>,
    pub(crate) format: EventFormat,
    pub(crate) data: EventData,
}

impl EventEnvelope {
    /// Start building an envelope with a fresh UUID v4 `event_id` and
    /// `occurred_at = now`.
    pub fn builder(
        event_type: impl Into<String>,
        source_service: impl Into<String>,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder::new(event_type.into(), source_service.into())
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Declared class, if the producer set one.
    pub fn event_class(&self) -> Option<EventClass> {
        self.event_class
    }

    /// Class used for routing. Envelopes without a declared class are
    /// treated as domain events.
    pub fn effective_class(&self) -> EventClass {
        self.event_class.unwrap_or(EventClass::Domain)
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn partition_key_path(&self) -> &str {
        &self.partition_key_path
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn source_service(&self) -> &str {
        &self.source_service
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn canonical_event(&self) -> Option<&str> {
        self.canonical_event.as_deref()
    }

    pub fn format(&self) -> EventFormat {
        self.format
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    /// Domain prefix of the event type (`thing` for `thing.created`).
    pub fn domain(&self) -> &str {
        self.event_type
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or(&self.event_type)
    }
}

/// How the builder derives the partition key.
#[derive(Debug, Clone)]
enum PartitionSpec {
    Unset,
    DataField(String),
    SourceService,
    Explicit { path: String, key: String },
}

/// Builder for producer-side envelopes.
///
/// The partition key is materialized from the payload at `build()` time so
/// that producers cannot drift from the partition key invariant.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    event_id: String,
    event_type: String,
    event_class: Option<EventClass>,
    occurred_at: DateTime<Utc>,
    partition: PartitionSpec,
    source_service: String,
    trace_id: Option<String>,
    schema_version: String,
    canonical_event: Option<String>,
    format: EventFormat,
    data: Option<Value>,
}

impl EnvelopeBuilder {
    fn new(event_type: String, source_service: String) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            event_class: None,
            occurred_at: Utc::now(),
            partition: PartitionSpec::Unset,
            source_service,
            trace_id: None,
            schema_version: "1".to_string(),
            canonical_event: None,
            format: EventFormat::Json,
            data: None,
        }
    }

    /// Override the generated event id (useful for testing and replays)
    pub fn event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn class(mut self, class: EventClass) -> Self {
        self.event_class = Some(class);
        self
    }

    pub fn occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn schema_version(mut self, schema_version: impl Into<String>) -> Self {
        self.schema_version = schema_version.into();
        self
    }

    pub fn canonical_event(mut self, canonical_event: impl Into<String>) -> Self {
        self.canonical_event = Some(canonical_event.into());
        self
    }

    pub fn format(mut self, format: EventFormat) -> Self {
        self.format = format;
        self
    }

    /// Key the event by a top-level payload field (`data.<field>`).
    pub fn partition_by_data(mut self, field: impl Into<String>) -> Self {
        self.partition = PartitionSpec::DataField(field.into());
        self
    }

    /// Key the event by its producer (`envelope.source_service`).
    pub fn partition_by_source(mut self) -> Self {
        self.partition = PartitionSpec::SourceService;
        self
    }

    /// Set path and key verbatim, without materialization.
    pub fn partition(mut self, path: impl Into<String>, key: impl Into<String>) -> Self {
        self.partition = PartitionSpec::Explicit {
            path: path.into(),
            key: key.into(),
        };
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, CodecError> {
        self.data = Some(serde_json::to_value(payload).map_err(CodecError::Encode)?);
        Ok(self)
    }

    pub fn build(self) -> Result<EventEnvelope, CodecError> {
        let data_value = self.data.unwrap_or(Value::Null);
        let data = EventData::from_value(&data_value)?;

        let (partition_key_path, partition_key) = match self.partition {
            PartitionSpec::Unset => {
                // Ops events are keyed by producer; everything else needs an explicit field.
                if self.event_class == Some(EventClass::Ops) {
                    (SOURCE_SERVICE_PATH.to_string(), self.source_service.clone())
                } else {
                    return Err(CodecError::MissingField("partition_key_path"));
                }
            }
            PartitionSpec::SourceService => {
                (SOURCE_SERVICE_PATH.to_string(), self.source_service.clone())
            }
            PartitionSpec::DataField(field) => {
                let key = data
                    .get_str(&field)
                    .ok_or(CodecError::MissingField("partition_key"))?;
                (format!("{DATA_PATH_PREFIX}{field}"), key)
            }
            PartitionSpec::Explicit { path, key } => (path, key),
        };

        Ok(EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type,
            event_class: self.event_class,
            occurred_at: self.occurred_at,
            partition_key_path,
            partition_key,
            source_service: self.source_service,
            trace_id: self.trace_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            schema_version: self.schema_version,
            canonical_event: self.canonical_event,
            format: self.format,
            data,
        })
    }
}
