//! Background relay: outbox → sinks, with DLQ escalation
//!
//! Each tick lists pending records in insertion order and publishes them one
//! by one. A domain publish failure ends the tick, so later records of the
//! same partition never overtake the failed one. After `max_attempts`
//! failures the record is written to the DLQ and parked.
//!
//! On shutdown the relay keeps publishing committed records until the outbox
//! is empty, a pass settles nothing, or `shutdown_grace` runs out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dlq::{DlqRecord, DlqStore};
use event_bus::{
    subject_for, CodecError, EventClass, ShutdownSignal, StoreError, DEFAULT_GRACE_PERIOD,
};
use event_consumer::DedupStore;
use tokio::task::JoinHandle;

use crate::sink::{AnalyticsSink, DomainSink};
use crate::{Outbox, OutboxRecord};

/// `error_type` written on DLQ records created by the relay.
pub const SINK_PUBLISH_FAILED: &str = "sink_publish_failed";

/// Extra time the handle waits past the drain deadline before aborting.
const STOP_SLACK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Failed domain publishes before a record is dead-lettered
    pub max_attempts: u32,
    /// Route `ops` events through the domain sink
    pub durable_ops: bool,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(2),
            max_attempts: 3,
            durable_ops: false,
            shutdown_grace: DEFAULT_GRACE_PERIOD,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("outbox store error: {0}")]
    Store(#[from] StoreError),

    #[error("envelope encoding failed: {0}")]
    Codec(#[from] CodecError),
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Domain records accepted by the domain sink
    pub published: usize,
    /// Best-effort records settled, delivered or not
    pub best_effort: usize,
    /// Domain records already processed downstream, settled without publish
    pub deduplicated: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        *self == TickReport::default()
    }

    /// Records taken off the pending list without a failure.
    pub fn settled(&self) -> usize {
        self.published + self.best_effort + self.deduplicated
    }
}

pub struct Relay {
    outbox: Arc<dyn Outbox>,
    domain: Arc<dyn DomainSink>,
    analytics: Arc<dyn AnalyticsSink>,
    dlq: Arc<dyn DlqStore>,
    dedup: Option<Arc<dyn DedupStore>>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(
        outbox: Arc<dyn Outbox>,
        domain: Arc<dyn DomainSink>,
        analytics: Arc<dyn AnalyticsSink>,
        dlq: Arc<dyn DlqStore>,
    ) -> Self {
        Self {
            outbox,
            domain,
            analytics,
            dlq,
            dedup: None,
            config: RelayConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Consult the downstream dedup store before counting a failure.
    pub fn with_dedup(mut self, dedup: Arc<dyn DedupStore>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn is_durable(&self, class: EventClass) -> bool {
        match class {
            EventClass::Domain => true,
            EventClass::Ops => self.config.durable_ops,
            EventClass::AnalyticsOnly => false,
        }
    }

    /// One pass over the pending records.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, RelayError> {
        self.tick_until(now, None).await
    }

    async fn tick_until(
        &self,
        now: DateTime<Utc>,
        shutdown: Option<&ShutdownSignal>,
    ) -> Result<TickReport, RelayError> {
        let pending = self.outbox.list_pending(self.config.batch_size).await?;
        let mut report = TickReport::default();

        for record in pending {
            if shutdown.is_some_and(|s| s.is_triggered()) {
                break;
            }

            if !self.is_durable(record.event_class) {
                self.publish_best_effort(&record, now).await?;
                report.best_effort += 1;
                continue;
            }

            let envelope = &record.envelope;
            match self.domain.publish(envelope).await {
                Ok(()) => {
                    self.outbox.mark_sent(record.record_id, now).await?;
                    report.published += 1;
                }
                Err(err) => {
                    if self.already_processed(&record, now).await? {
                        self.outbox.mark_sent(record.record_id, now).await?;
                        report.deduplicated += 1;
                        continue;
                    }

                    let summary = err.to_string();
                    let attempts = self.outbox.record_failure(record.record_id, &summary).await?;
                    report.failed += 1;
                    tracing::warn!(
                        record_id = %record.record_id,
                        event_id = %envelope.event_id(),
                        event_type = %envelope.event_type(),
                        attempts,
                        error = %err,
                        "domain publish failed"
                    );

                    if attempts >= self.config.max_attempts {
                        self.dead_letter(&record, &summary, attempts, now).await?;
                        report.dead_lettered += 1;
                    }
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn publish_best_effort(
        &self,
        record: &OutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        if let Err(err) = self.analytics.publish(&record.envelope).await {
            tracing::warn!(
                record_id = %record.record_id,
                event_id = %record.envelope.event_id(),
                event_class = %record.event_class,
                error = %err,
                "best-effort publish failed, dropping"
            );
        }
        self.outbox.mark_sent(record.record_id, now).await?;
        Ok(())
    }

    async fn already_processed(
        &self,
        record: &OutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, RelayError> {
        let Some(dedup) = &self.dedup else {
            return Ok(false);
        };
        let duplicate = dedup.is_duplicate(record.envelope.event_id(), now).await?;
        if duplicate {
            tracing::info!(
                record_id = %record.record_id,
                event_id = %record.envelope.event_id(),
                "publish failed but event already processed downstream, marking sent"
            );
        }
        Ok(duplicate)
    }

    async fn dead_letter(
        &self,
        record: &OutboxRecord,
        summary: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        let envelope = &record.envelope;
        let dlq_record = DlqRecord::for_envelope(subject_for(envelope), envelope, summary, now)?
            .with_error_type(SINK_PUBLISH_FAILED)
            .with_retry_count(attempts as i32);
        let dlq_id = dlq_record.id;

        self.dlq.create(dlq_record).await?;
        self.outbox.park(record.record_id, now).await?;

        tracing::error!(
            record_id = %record.record_id,
            dlq_id = %dlq_id,
            event_id = %envelope.event_id(),
            event_type = %envelope.event_type(),
            retry_count = attempts,
            "outbox record dead-lettered"
        );
        Ok(())
    }

    /// Tick every `poll_interval` until `shutdown` fires.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            "Starting outbox relay"
        );

        let mut tick_count: u64 = 0;
        while !shutdown.is_triggered() {
            tick_count += 1;

            match self.tick_until(Utc::now(), Some(&shutdown)).await {
                Ok(report) if !report.is_quiet() => {
                    tracing::info!(
                        tick = tick_count,
                        published = report.published,
                        best_effort = report.best_effort,
                        deduplicated = report.deduplicated,
                        failed = report.failed,
                        dead_lettered = report.dead_lettered,
                        "Relay tick"
                    );
                }
                Ok(_) => {
                    if tick_count <= 3 || tick_count % 60 == 0 {
                        tracing::info!(tick = tick_count, "Relay tick: no pending records");
                    }
                }
                Err(e) => {
                    tracing::error!(tick = tick_count, error = %e, "Relay tick failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        let drained = self.drain(self.config.shutdown_grace).await;
        tracing::info!(ticks = tick_count, drained, "Outbox relay stopped");
    }

    /// Publish committed records until none are pending, a pass settles
    /// nothing, or `grace` elapses. Returns the number of records settled.
    pub async fn drain(&self, grace: Duration) -> usize {
        let mut settled = 0;
        let finished = tokio::time::timeout(grace, async {
            loop {
                match self.tick(Utc::now()).await {
                    Ok(report) if report.settled() > 0 => settled += report.settled(),
                    Ok(_) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "Relay drain tick failed");
                        break;
                    }
                }
            }
        })
        .await;

        if finished.is_err() {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                settled,
                "relay drain hit the grace deadline with records pending"
            );
        }
        settled
    }

    /// Run on the current runtime.
    pub fn spawn(self: Arc<Self>, shutdown: ShutdownSignal) -> RelayHandle {
        let grace = self.config.shutdown_grace;
        let signal = shutdown.clone();
        let join = tokio::spawn(async move { self.run(signal).await });
        RelayHandle { shutdown, join, grace }
    }
}

/// Owner handle for a spawned relay.
pub struct RelayHandle {
    shutdown: ShutdownSignal,
    join: JoinHandle<()>,
    grace: Duration,
}

impl RelayHandle {
    /// Signal the relay and wait for it to drain the outbox, at most the
    /// grace period; abort afterwards. Returns false if it was aborted.
    pub async fn shutdown(mut self) -> bool {
        self.shutdown.trigger();
        match tokio::time::timeout(self.grace + STOP_SLACK, &mut self.join).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    grace_ms = self.grace.as_millis() as u64,
                    "relay did not stop in time, aborting"
                );
                self.join.abort();
                false
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
