use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{ConfigError, ConfigValidator};

/// Ten years; longer retention windows are rejected.
pub const MAX_RETENTION_HOURS: u64 = 24 * 365 * 10;
pub const MAX_CLOCK_SKEW_MINUTES: u64 = 24 * 60;
pub const MAX_IN_FLIGHT_SECONDS: u64 = 24 * 3600;

/// Tunables shared by the integrity substrate. Values come from an optional
/// YAML file, then environment variables override them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub idempotency_ttl_hours: u64,
    pub event_dedup_ttl_hours: u64,
    /// How long sent outbox records are kept before the sweeper removes them
    pub outbox_retention_hours: u64,
    pub worker_poll_seconds: u64,
    pub outbox_flush_batch_size: usize,
    pub clock_skew_minutes: u64,
    pub shutdown_grace_seconds: u64,
    pub relay_max_attempts: u32,
    pub idempotency_in_flight_seconds: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl_hours: 168,
            event_dedup_ttl_hours: 168,
            outbox_retention_hours: 168,
            worker_poll_seconds: 2,
            outbox_flush_batch_size: 100,
            clock_skew_minutes: 5,
            shutdown_grace_seconds: 10,
            relay_max_attempts: 3,
            idempotency_in_flight_seconds: 60,
        }
    }
}

impl IntegrityConfig {
    /// YAML at `path` (if any), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut validator = ConfigValidator::from_env();
        Self::load_with(path, &mut validator)
    }

    /// Same as [`load`](Self::load) with a caller-supplied variable source.
    pub fn load_with(
        path: Option<&Path>,
        validator: &mut ConfigValidator<'_>,
    ) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        let config = base.with_overrides(validator);
        if !validator.errors().is_empty() {
            return Err(ConfigError::Invalid(validator.errors().to_vec()));
        }
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text).map_err(|e| match e {
            ConfigError::Yaml { source, .. } => ConfigError::Yaml {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
            path: "<inline>".to_string(),
            source,
        })
    }

    fn with_overrides(self, v: &mut ConfigValidator<'_>) -> Self {
        Self {
            idempotency_ttl_hours: v.bounded_or(
                "IDEMPOTENCY_TTL_HOURS",
                self.idempotency_ttl_hours,
                MAX_RETENTION_HOURS,
            ),
            event_dedup_ttl_hours: v.bounded_or(
                "EVENT_DEDUP_TTL_HOURS",
                self.event_dedup_ttl_hours,
                MAX_RETENTION_HOURS,
            ),
            outbox_retention_hours: v.bounded_or(
                "OUTBOX_RETENTION_HOURS",
                self.outbox_retention_hours,
                MAX_RETENTION_HOURS,
            ),
            worker_poll_seconds: v.positive_or("WORKER_POLL_SECONDS", self.worker_poll_seconds),
            outbox_flush_batch_size: v.positive_or(
                "OUTBOX_FLUSH_BATCH_SIZE",
                self.outbox_flush_batch_size,
            ),
            clock_skew_minutes: v.bounded_or(
                "CLOCK_SKEW_MINUTES",
                self.clock_skew_minutes,
                MAX_CLOCK_SKEW_MINUTES,
            ),
            shutdown_grace_seconds: v
                .parse_or("SHUTDOWN_GRACE_SECONDS", self.shutdown_grace_seconds),
            relay_max_attempts: v.positive_or("RELAY_MAX_ATTEMPTS", self.relay_max_attempts),
            idempotency_in_flight_seconds: v.bounded_or(
                "IDEMPOTENCY_IN_FLIGHT_SECONDS",
                self.idempotency_in_flight_seconds,
                MAX_IN_FLIGHT_SECONDS,
            ),
        }
    }

    pub fn idempotency_ttl(&self) -> Duration {
        hours(self.idempotency_ttl_hours)
    }

    pub fn event_dedup_ttl(&self) -> Duration {
        hours(self.event_dedup_ttl_hours)
    }

    pub fn outbox_retention(&self) -> Duration {
        hours(self.outbox_retention_hours)
    }

    pub fn worker_poll(&self) -> Duration {
        Duration::from_secs(self.worker_poll_seconds)
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_minutes.saturating_mul(60))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn idempotency_in_flight(&self) -> Duration {
        Duration::from_secs(self.idempotency_in_flight_seconds)
    }
}

fn hours(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(3600))
}
