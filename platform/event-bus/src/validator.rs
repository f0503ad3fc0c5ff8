//! Envelope validation
//!
//! Applies the platform event contract to a decoded envelope. Checks run in a
//! fixed order and the first failure wins:
//!
//! 1. Presence of every required field and a non-empty payload
//! 2. Shape: type regex and lengths, deprecated plural domains need a canonical alias
//! 3. Class policy: allowed event types, expected event class
//! 4. Partition path: allow-list (with legacy `<field>` aliases) or the default
//!    ops / data keying rules
//! 5. Partition key invariant: the value at the path equals `partition_key`
//! 6. Clock skew window around the receiver's clock
//! 7. Avro envelopes need a registered `{event_type}-value` schema
//!
//! Validation is a pure function of envelope, policy, clock and registry.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::codec;
use crate::envelope::{
    EventClass, EventEnvelope, EventFormat, DATA_PATH_PREFIX, SOURCE_SERVICE_PATH,
};
use crate::schema_registry::{value_subject, SchemaRegistry};

pub const MAX_EVENT_TYPE_LEN: usize = 100;
pub const MAX_SOURCE_SERVICE_LEN: usize = 50;
pub const DEFAULT_CLOCK_SKEW_MINUTES: i64 = 5;

/// Plural domain prefixes kept only for migration; events under them must
/// carry a singular `canonical_event` alias.
pub const DEFAULT_DEPRECATED_DOMAINS: &[&str] = &["submissions", "payouts", "rewards", "disputes"];

static EVENT_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*\.[a-z0-9_]+(\.[a-z0-9_]+)?$").expect("event type regex compiles")
});

/// True when `event_type` matches the canonical dotted form.
pub fn is_valid_event_type(event_type: &str) -> bool {
    EVENT_TYPE_RE.is_match(event_type)
}

/// Machine-readable reason for an invalid envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    MissingField,
    EventTypeTooLong,
    InvalidEventType,
    SourceServiceTooLong,
    DeprecatedDomain,
    PartitionPathNotAllowed,
    OpsPartitionPath,
    PartitionKeyMissing,
    PartitionKeyMismatch,
    ClockSkew,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::MissingField => "missing_field",
            InvalidReason::EventTypeTooLong => "event_type_too_long",
            InvalidReason::InvalidEventType => "invalid_event_type",
            InvalidReason::SourceServiceTooLong => "source_service_too_long",
            InvalidReason::DeprecatedDomain => "deprecated_domain",
            InvalidReason::PartitionPathNotAllowed => "partition_path_not_allowed",
            InvalidReason::OpsPartitionPath => "ops_partition_path",
            InvalidReason::PartitionKeyMissing => "partition_key_missing",
            InvalidReason::PartitionKeyMismatch => "partition_key_mismatch",
            InvalidReason::ClockSkew => "clock_skew",
        }
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope rejected by validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid event envelope ({reason}): {detail}")]
    Invalid { reason: InvalidReason, detail: String },

    #[error("unsupported event type: {0}")]
    UnsupportedEventType(String),

    #[error("unsupported event class: expected {expected}, got {actual}")]
    UnsupportedEventClass {
        expected: EventClass,
        actual: EventClass,
    },

    #[error("schema not found for subject {0}")]
    SchemaNotFound(String),
}

impl EnvelopeError {
    fn invalid(reason: InvalidReason, detail: impl Into<String>) -> Self {
        EnvelopeError::Invalid {
            reason,
            detail: detail.into(),
        }
    }

    /// Error code surfaced over HTTP and recorded as DLQ `error_type`.
    pub fn code(&self) -> &'static str {
        match self {
            EnvelopeError::Invalid { .. } => "invalid_event_envelope",
            EnvelopeError::UnsupportedEventType(_) => "unsupported_event_type",
            EnvelopeError::UnsupportedEventClass { .. } => "unsupported_event_class",
            EnvelopeError::SchemaNotFound(_) => "schema_not_found",
        }
    }

    /// Fine-grained reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            EnvelopeError::Invalid { reason, .. } => reason.as_str(),
            other => other.code(),
        }
    }
}

/// What a consumer (or producer) accepts.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    /// Class the caller expects; a differing declared class is rejected.
    pub expected_class: Option<EventClass>,
    /// Event types the caller handles; `None` accepts every type.
    pub allowed_types: Option<BTreeSet<String>>,
    /// Partition paths the caller accepts; `None` applies the default rules.
    pub allowed_partition_paths: Option<Vec<String>>,
    /// Accept bare `<field>` as an alias of `data.<field>`.
    pub accept_legacy_paths: bool,
    pub deprecated_domains: BTreeSet<String>,
    pub max_clock_skew: Duration,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            expected_class: None,
            allowed_types: None,
            allowed_partition_paths: None,
            accept_legacy_paths: false,
            deprecated_domains: DEFAULT_DEPRECATED_DOMAINS.iter().map(|d| d.to_string()).collect(),
            max_clock_skew: Duration::minutes(DEFAULT_CLOCK_SKEW_MINUTES),
        }
    }
}

impl ValidationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_class(mut self, class: EventClass) -> Self {
        self.expected_class = Some(class);
        self
    }

    pub fn allow_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn allow_partition_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_partition_paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn accept_legacy_paths(mut self, accept: bool) -> Self {
        self.accept_legacy_paths = accept;
        self
    }

    pub fn max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    pub fn deprecated_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deprecated_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Map a legacy bare `<field>` path onto `data.<field>` when permitted.
    fn normalize_path(&self, path: &str) -> String {
        let is_bare_field = !path.is_empty() && !path.contains('.');
        if self.accept_legacy_paths && is_bare_field {
            format!("{DATA_PATH_PREFIX}{path}")
        } else {
            path.to_string()
        }
    }
}

/// Validator bound to a policy and an optional schema registry.
#[derive(Clone)]
pub struct EnvelopeValidator {
    policy: ValidationPolicy,
    registry: Option<Arc<dyn SchemaRegistry>>,
}

impl fmt::Debug for EnvelopeValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeValidator")
            .field("policy", &self.policy)
            .field("registry", &self.registry.is_some())
            .finish()
    }
}

impl EnvelopeValidator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self {
            policy,
            registry: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    pub fn validate(
        &self,
        envelope: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<(), EnvelopeError> {
        validate_envelope(envelope, &self.policy, now, self.registry.as_deref())
    }
}

/// Validate an envelope against a policy at time `now`.
pub fn validate_envelope(
    envelope: &EventEnvelope,
    policy: &ValidationPolicy,
    now: DateTime<Utc>,
    registry: Option<&dyn SchemaRegistry>,
) -> Result<(), EnvelopeError> {
    check_presence(envelope)?;
    check_shape(envelope, policy)?;
    check_class_policy(envelope, policy)?;
    let resolved_path = check_partition_path(envelope, policy)?;
    check_partition_key(envelope, &resolved_path)?;
    check_clock_skew(envelope, policy, now)?;
    check_schema(envelope, registry)?;
    Ok(())
}

fn check_presence(envelope: &EventEnvelope) -> Result<(), EnvelopeError> {
    let required = [
        ("event_id", envelope.event_id()),
        ("event_type", envelope.event_type()),
        ("source_service", envelope.source_service()),
        ("trace_id", envelope.trace_id()),
        ("schema_version", envelope.schema_version()),
        ("partition_key_path", envelope.partition_key_path()),
        ("partition_key", envelope.partition_key()),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(EnvelopeError::invalid(
                InvalidReason::MissingField,
                format!("missing required field: {name}"),
            ));
        }
    }
    if envelope.data().is_empty() {
        return Err(EnvelopeError::invalid(
            InvalidReason::MissingField,
            "missing required field: data",
        ));
    }
    Ok(())
}

fn check_shape(envelope: &EventEnvelope, policy: &ValidationPolicy) -> Result<(), EnvelopeError> {
    let event_type = envelope.event_type();
    let type_len = event_type.chars().count();
    if type_len > MAX_EVENT_TYPE_LEN {
        return Err(EnvelopeError::invalid(
            InvalidReason::EventTypeTooLong,
            format!("event_type must be at most {MAX_EVENT_TYPE_LEN} characters, got {type_len}"),
        ));
    }
    if !is_valid_event_type(event_type) {
        return Err(EnvelopeError::invalid(
            InvalidReason::InvalidEventType,
            format!("event_type '{event_type}' is not a lowercase dotted identifier"),
        ));
    }

    let source_len = envelope.source_service().chars().count();
    if source_len > MAX_SOURCE_SERVICE_LEN {
        return Err(EnvelopeError::invalid(
            InvalidReason::SourceServiceTooLong,
            format!(
                "source_service must be at most {MAX_SOURCE_SERVICE_LEN} characters, \
                 got {source_len}"
            ),
        ));
    }

    if policy.deprecated_domains.contains(envelope.domain()) {
        match envelope.canonical_event() {
            None => {
                return Err(EnvelopeError::invalid(
                    InvalidReason::DeprecatedDomain,
                    format!(
                        "event_type '{event_type}' uses deprecated domain '{}' \
                         and has no canonical_event alias",
                        envelope.domain()
                    ),
                ));
            }
            Some(alias) => {
                let alias_domain = alias.split_once('.').map(|(d, _)| d).unwrap_or(alias);
                if !is_valid_event_type(alias) || policy.deprecated_domains.contains(alias_domain) {
                    return Err(EnvelopeError::invalid(
                        InvalidReason::DeprecatedDomain,
                        format!("canonical_event '{alias}' is not a canonical event type"),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn check_class_policy(
    envelope: &EventEnvelope,
    policy: &ValidationPolicy,
) -> Result<(), EnvelopeError> {
    if let Some(allowed) = &policy.allowed_types {
        let by_type = allowed.contains(envelope.event_type());
        let by_alias = envelope
            .canonical_event()
            .map(|alias| allowed.contains(alias))
            .unwrap_or(false);
        if !by_type && !by_alias {
            return Err(EnvelopeError::UnsupportedEventType(envelope.event_type().to_string()));
        }
    }

    if let (Some(expected), Some(actual)) = (policy.expected_class, envelope.event_class()) {
        if expected != actual {
            return Err(EnvelopeError::UnsupportedEventClass { expected, actual });
        }
    }
    Ok(())
}

/// Returns the path the partition key invariant is checked against.
fn check_partition_path(
    envelope: &EventEnvelope,
    policy: &ValidationPolicy,
) -> Result<String, EnvelopeError> {
    let declared = envelope.partition_key_path();
    let resolved = policy.normalize_path(declared);

    if let Some(allowed) = &policy.allowed_partition_paths {
        let permitted = allowed
            .iter()
            .any(|candidate| candidate == declared || policy.normalize_path(candidate) == resolved);
        if !permitted {
            return Err(EnvelopeError::invalid(
                InvalidReason::PartitionPathNotAllowed,
                format!("partition_key_path '{declared}' is not allowed by policy"),
            ));
        }
    }

    let class = envelope
        .event_class()
        .or(policy.expected_class)
        .unwrap_or(EventClass::Domain);

    if class == EventClass::Ops {
        if resolved != SOURCE_SERVICE_PATH {
            return Err(EnvelopeError::invalid(
                InvalidReason::OpsPartitionPath,
                format!("ops events must be keyed by {SOURCE_SERVICE_PATH}, got '{declared}'"),
            ));
        }
        return Ok(resolved);
    }

    match resolved.strip_prefix(DATA_PATH_PREFIX) {
        Some(field) if !field.is_empty() && !field.contains('.') => Ok(resolved),
        Some(_) => Err(EnvelopeError::invalid(
            InvalidReason::PartitionPathNotAllowed,
            format!("partition_key_path '{declared}' must address a single top-level data field"),
        )),
        None => Err(EnvelopeError::invalid(
            InvalidReason::PartitionPathNotAllowed,
            format!("partition_key_path '{declared}' must start with '{DATA_PATH_PREFIX}'"),
        )),
    }
}

fn check_partition_key(envelope: &EventEnvelope, resolved_path: &str) -> Result<(), EnvelopeError> {
    let value = codec::field(envelope, resolved_path).ok_or_else(|| {
        EnvelopeError::invalid(
            InvalidReason::PartitionKeyMissing,
            format!("no value at partition_key_path '{resolved_path}'"),
        )
    })?;

    if value != envelope.partition_key() {
        return Err(EnvelopeError::invalid(
            InvalidReason::PartitionKeyMismatch,
            format!(
                "partition_key '{}' does not match value '{}' at '{}'",
                envelope.partition_key(),
                value,
                resolved_path
            ),
        ));
    }
    Ok(())
}

fn check_clock_skew(
    envelope: &EventEnvelope,
    policy: &ValidationPolicy,
    now: DateTime<Utc>,
) -> Result<(), EnvelopeError> {
    let drift = envelope.occurred_at().signed_duration_since(now);
    if drift.abs() > policy.max_clock_skew {
        return Err(EnvelopeError::invalid(
            InvalidReason::ClockSkew,
            format!(
                "occurred_at {} is {}s away from receiver clock (max {}s)",
                envelope.occurred_at().to_rfc3339(),
                drift.num_seconds(),
                policy.max_clock_skew.num_seconds()
            ),
        ));
    }
    Ok(())
}

fn check_schema(
    envelope: &EventEnvelope,
    registry: Option<&dyn SchemaRegistry>,
) -> Result<(), EnvelopeError> {
    if envelope.format() != EventFormat::Avro {
        return Ok(());
    }
    let subject = value_subject(envelope.event_type());
    match registry {
        Some(registry) if registry.is_registered(&subject) => Ok(()),
        _ => Err(EnvelopeError::SchemaNotFound(subject)),
    }
}
