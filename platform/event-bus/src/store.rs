//! Shared store plumbing: error type and lifecycle state
//!
//! Every durable store (dedup, idempotency, outbox, DLQ) moves through
//! `Opened → Draining → Closed`. Writes are refused once draining starts;
//! reads are refused only after close.

use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, TimeDelta, Utc};

/// Errors surfaced by durable stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable, or the store is draining / closed
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Transient failures may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Database(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// `now + ttl`, clamped to the latest representable instant.
pub fn expires_at(now: DateTime<Utc>, ttl: TimeDelta) -> DateTime<Utc> {
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Opened,
    Draining,
    Closed,
}

/// Lifecycle flag shared by a store and its handles.
#[derive(Debug)]
pub struct StoreLifecycle {
    name: &'static str,
    state: AtomicU8,
}

const OPENED: u8 = 0;
const DRAINING: u8 = 1;
const CLOSED: u8 = 2;

impl StoreLifecycle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: AtomicU8::new(OPENED),
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self.state.load(Ordering::Acquire) {
            OPENED => LifecycleState::Opened,
            DRAINING => LifecycleState::Draining,
            _ => LifecycleState::Closed,
        }
    }

    pub fn ensure_writable(&self) -> Result<(), StoreError> {
        match self.state() {
            LifecycleState::Opened => Ok(()),
            state => Err(StoreError::Unavailable(format!(
                "{} is {:?}, writes rejected",
                self.name, state
            ))),
        }
    }

    pub fn ensure_readable(&self) -> Result<(), StoreError> {
        match self.state() {
            LifecycleState::Closed => {
                Err(StoreError::Unavailable(format!("{} is closed", self.name)))
            }
            _ => Ok(()),
        }
    }

    /// Stop accepting writes. No-op once closed.
    pub fn begin_drain(&self) {
        let _ = self
            .state
            .compare_exchange(OPENED, DRAINING, Ordering::AcqRel, Ordering::Acquire);
        tracing::debug!(store = self.name, "store draining");
    }

    pub fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
        tracing::debug!(store = self.name, "store closed");
    }
}
