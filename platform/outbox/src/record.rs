use chrono::{DateTime, Utc};
use event_bus::{EventClass, EventEnvelope};
use uuid::Uuid;

/// One entry of the outbox log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub record_id: Uuid,
    pub event_class: EventClass,
    pub envelope: EventEnvelope,
    pub created_at: DateTime<Utc>,
    /// Set by the relay once the sink accepted the event
    pub sent_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Set when the record was escalated to the DLQ and taken out of the relay
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn new(envelope: EventEnvelope, created_at: DateTime<Utc>) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            event_class: envelope.effective_class(),
            envelope,
            created_at,
            sent_at: None,
            attempts: 0,
            last_error: None,
            dead_lettered_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.sent_at.is_none() && self.dead_lettered_at.is_none()
    }
}
