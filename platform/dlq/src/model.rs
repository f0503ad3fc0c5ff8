use chrono::{DateTime, Utc};
use event_bus::{codec, CodecError, EventEnvelope};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_QUERY_LIMIT: u32 = 100;
pub const MAX_QUERY_LIMIT: u32 = 1000;

/// A delivery that failed after its retry policy was exhausted, or was
/// rejected terminally on the inbound side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqRecord {
    pub id: Uuid,
    /// Subject the event was published on (or consumed from)
    pub source_topic: String,
    pub consumer_group: Option<String>,
    /// Machine-readable failure code (`sink_publish_failed`, `partition_key_mismatch`, ...)
    pub error_type: Option<String>,
    pub error_summary: String,
    pub retry_count: i32,
    pub event_id: Option<String>,
    /// Serialized envelope exactly as it was handed to the sink or received
    #[serde(with = "bytes_as_text")]
    pub original_event: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DlqRecord {
    pub fn new(
        source_topic: impl Into<String>,
        error_summary: impl Into<String>,
        original_event: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_topic: source_topic.into(),
            consumer_group: None,
            error_type: None,
            error_summary: error_summary.into(),
            retry_count: 0,
            event_id: None,
            original_event,
            created_at,
            replayed_at: None,
        }
    }

    /// Record for an envelope, with `event_id` filled in.
    pub fn for_envelope(
        source_topic: impl Into<String>,
        envelope: &EventEnvelope,
        error_summary: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, CodecError> {
        let bytes = codec::encode(envelope)?;
        let mut record = Self::new(source_topic, error_summary, bytes, created_at);
        record.event_id = Some(envelope.event_id().to_string());
        Ok(record)
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: i32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn is_replayed(&self) -> bool {
        self.replayed_at.is_some()
    }

    /// Decode the stored envelope.
    pub fn envelope(&self) -> Result<EventEnvelope, CodecError> {
        codec::decode(&self.original_event)
    }
}

/// Envelope bytes are JSON text; keep them readable in API responses.
mod bytes_as_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(deserializer).map(String::into_bytes)
    }
}

/// Filter for [`crate::DlqStore::query`]. Unset filters match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqQuery {
    #[serde(default)]
    pub source_topic: Option<String>,
    #[serde(default)]
    pub consumer_group: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub include_replayed: bool,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl DlqQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_topic(mut self, topic: impl Into<String>) -> Self {
        self.source_topic = Some(topic.into());
        self
    }

    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    pub fn error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn include_replayed(mut self, include: bool) -> Self {
        self.include_replayed = include;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Limit actually applied: default 100, clamped to `1..=1000`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT)
    }

    pub fn matches(&self, record: &DlqRecord) -> bool {
        if !self.include_replayed && record.is_replayed() {
            return false;
        }
        if let Some(topic) = &self.source_topic {
            if &record.source_topic != topic {
                return false;
            }
        }
        if let Some(group) = &self.consumer_group {
            if record.consumer_group.as_ref() != Some(group) {
                return false;
            }
        }
        if let Some(error_type) = &self.error_type {
            if record.error_type.as_ref() != Some(error_type) {
                return false;
            }
        }
        true
    }
}
