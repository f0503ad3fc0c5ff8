//! Envelope codec
//!
//! Serializes envelopes to their JSON wire form and back. Decoding enforces
//! structural shape only (types, timestamps, payload must be an object);
//! semantic rules live in [`crate::validator`].
//!
//! Strings are trimmed on decode. Unknown fields are tolerated on read and
//! never written.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::value::RawValue;

use crate::envelope::{EventClass, EventData, EventEnvelope, EventFormat, DATA_PATH_PREFIX};

/// Structural envelope errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid occurred_at: must be an RFC 3339 timestamp, got '{0}'")]
    InvalidTimestamp(String),

    #[error("unknown event_class: {0}")]
    UnknownEventClass(String),

    #[error("unknown format: {0}")]
    UnknownFormat(String),

    #[error("data must not be null")]
    NullData,

    #[error("data must be a JSON object")]
    DataNotObject,
}

/// Permissive shape of an envelope on the wire.
///
/// Every string may be absent so that presence checks are reported by the
/// validator with a precise reason rather than a generic parse failure.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct WireEnvelope {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    event_class: Option<String>,
    #[serde(default)]
    occurred_at: Option<String>,
    #[serde(default)]
    partition_key_path: Option<String>,
    #[serde(default)]
    partition_key: Option<String>,
    #[serde(default)]
    source_service: Option<String>,
    #[serde(default)]
    trace_id: Option<String>,
    #[serde(default)]
    schema_version: Option<String>,
    #[serde(default)]
    canonical_event: Option<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

fn normalize(value: Option<String>) -> String {
    value.map(|s| s.trim().to_string()).unwrap_or_default()
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl TryFrom<WireEnvelope> for EventEnvelope {
    type Error = CodecError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let occurred_raw = normalize(wire.occurred_at);
        if occurred_raw.is_empty() {
            return Err(CodecError::MissingField("occurred_at"));
        }
        let occurred_at = DateTime::parse_from_rfc3339(&occurred_raw)
            .map_err(|_| CodecError::InvalidTimestamp(occurred_raw.clone()))?
            .with_timezone(&Utc);

        let event_class = match normalize_opt(wire.event_class) {
            Some(raw) => Some(raw.parse::<EventClass>()?),
            None => None,
        };

        let format = match normalize_opt(wire.format) {
            Some(raw) => raw.parse::<EventFormat>()?,
            None => EventFormat::Json,
        };

        let data = match wire.data {
            Some(raw) => EventData::from_raw(raw)?,
            None => return Err(CodecError::NullData),
        };

        Ok(EventEnvelope {
            event_id: normalize(wire.event_id),
            event_type: normalize(wire.event_type),
            event_class,
            occurred_at,
            partition_key_path: normalize(wire.partition_key_path),
            partition_key: normalize(wire.partition_key),
            source_service: normalize(wire.source_service),
            trace_id: normalize(wire.trace_id),
            schema_version: normalize(wire.schema_version),
            canonical_event: normalize_opt(wire.canonical_event),
            format,
            data,
        })
    }
}

/// Serialize an envelope to its JSON wire form.
pub fn encode(envelope: &EventEnvelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(CodecError::Encode)
}

/// Parse an envelope from its JSON wire form.
pub fn decode(bytes: &[u8]) -> Result<EventEnvelope, CodecError> {
    let wire: WireEnvelope = serde_json::from_slice(bytes).map_err(CodecError::Malformed)?;
    EventEnvelope::try_from(wire)
}

/// Resolve a field path against an envelope.
///
/// Supported paths:
/// - `envelope.<name>` for the top-level string fields (`source_service`,
///   `event_id`, `event_type`, `trace_id`, `schema_version`)
/// - `data.<name>` for a single-level payload field
///
/// Nested payload paths (`data.a.b`) are not addressable and return `None`.
pub fn field(envelope: &EventEnvelope, path: &str) -> Option<String> {
    if let Some(name) = path.strip_prefix("envelope.") {
        let value = match name {
            "source_service" => envelope.source_service(),
            "event_id" => envelope.event_id(),
            "event_type" => envelope.event_type(),
            "trace_id" => envelope.trace_id(),
            "schema_version" => envelope.schema_version(),
            _ => return None,
        };
        return Some(value.trim().to_string());
    }

    let name = path.strip_prefix(DATA_PATH_PREFIX)?;
    if name.is_empty() || name.contains('.') {
        return None;
    }
    envelope.data().get_str(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_json() -> serde_json::Value {
        json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "event_type": "thing.created",
            "event_class": "domain",
            "occurred_at": "2026-02-12T00:00:00Z",
            "partition_key_path": "data.id",
            "partition_key": "t-1",
            "source_service": "smoke-test",
            "trace_id": "trace-123",
            "schema_version": "1",
            "format": "json",
            "data": {"id": "t-1", "name": "a"}
        })
    }

    #[test]
    fn test_round_trip_preserves_envelope() {
        let envelope = decode(&serde_json::to_vec(&sample_json()).unwrap()).unwrap();
        let bytes = encode(&envelope).unwrap();
        let again = decode(&bytes).unwrap();
        assert_eq!(envelope, again);
    }

    #[test]
    fn test_decode_trims_strings() {
        let mut value = sample_json();
        value["source_service"] = json!("  smoke-test  ");
        value["partition_key"] = json!(" t-1\n");
        let envelope = decode(&serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(envelope.source_service(), "smoke-test");
        assert_eq!(envelope.partition_key(), "t-1");
    }

    #[test]
    fn test_decode_rejects_null_data() {
        let mut value = sample_json();
        value["data"] = serde_json::Value::Null;
        let err = decode(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(matches!(err, CodecError::NullData));
    }

    #[test]
    fn test_decode_rejects_non_object_data() {
        let mut value = sample_json();
        value["data"] = json!([1, 2, 3]);
        let err = decode(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(matches!(err, CodecError::DataNotObject));
    }

    #[test]
    fn test_decode_tolerates_unknown_fields_and_drops_them() {
        let mut value = sample_json();
        value["tenant_id"] = json!("tenant-123");
        let envelope = decode(&serde_json::to_vec(&value).unwrap()).unwrap();
        let encoded: serde_json::Value =
            serde_json::from_slice(&encode(&envelope).unwrap()).unwrap();
        assert!(encoded.get("tenant_id").is_none());
    }

    #[test]
    fn test_decode_defaults_format_to_json() {
        let mut value = sample_json();
        value.as_object_mut().unwrap().remove("format");
        let envelope = decode(&serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(envelope.format(), EventFormat::Json);
    }

    #[test]
    fn test_decode_rejects_bad_timestamp() {
        let mut value = sample_json();
        value["occurred_at"] = json!("yesterday");
        assert!(matches!(
            decode(&serde_json::to_vec(&value).unwrap()),
            Err(CodecError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_decode_accepts_offset_timestamps() {
        let mut value = sample_json();
        value["occurred_at"] = json!("2026-02-12T02:00:00+02:00");
        let envelope = decode(&serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(envelope.occurred_at().to_rfc3339(), "2026-02-12T00:00:00+00:00");
    }

    #[test]
    fn test_decode_rejects_unknown_class() {
        let mut value = sample_json();
        value["event_class"] = json!("audit");
        assert!(matches!(
            decode(&serde_json::to_vec(&value).unwrap()),
            Err(CodecError::UnknownEventClass(_))
        ));
    }

    #[test]
    fn test_missing_strings_decode_as_empty() {
        let mut value = sample_json();
        value.as_object_mut().unwrap().remove("trace_id");
        let envelope = decode(&serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(envelope.trace_id(), "");
    }

    #[test]
    fn test_field_paths() {
        let envelope = decode(&serde_json::to_vec(&sample_json()).unwrap()).unwrap();
        assert_eq!(field(&envelope, "envelope.source_service").as_deref(), Some("smoke-test"));
        assert_eq!(field(&envelope, "data.id").as_deref(), Some("t-1"));
        assert_eq!(field(&envelope, "data.missing"), None);
        assert_eq!(field(&envelope, "data.id.deep"), None);
        assert_eq!(field(&envelope, "id"), None);
        assert_eq!(field(&envelope, "envelope.data"), None);
    }
}
