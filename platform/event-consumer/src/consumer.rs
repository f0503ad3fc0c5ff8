//! Long-running bus consumer
//!
//! Subscribes to a subject, feeds each message through the
//! [`InboundPipeline`] under bounded retry, and dead-letters what cannot be
//! processed. Shutdown is honoured between messages, never in the middle of
//! one.

use std::sync::Arc;

use chrono::Utc;
use dlq::{DlqRecord, DlqStore};
use event_bus::consumer_retry::{retry_classified, RetryConfig};
use event_bus::{codec, BusMessage, BusResult, EventBus, EventEnvelope, ShutdownSignal};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::pipeline::{InboundPipeline, PipelineError, ProcessOutcome};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Subject pattern to subscribe to (wildcards allowed)
    pub subject: String,
    /// Recorded on DLQ entries so operators can replay per consumer
    pub consumer_group: String,
    pub retry: RetryConfig,
}

impl ConsumerConfig {
    pub fn new(subject: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            consumer_group: consumer_group.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Counters reported when the consumer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub processed: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
}

/// Spawn [`run_consumer`] on the current runtime.
pub fn spawn_consumer(
    config: ConsumerConfig,
    bus: Arc<dyn EventBus>,
    pipeline: Arc<InboundPipeline>,
    dlq: Arc<dyn DlqStore>,
    shutdown: ShutdownSignal,
) -> JoinHandle<BusResult<ConsumerStats>> {
    tokio::spawn(run_consumer(config, bus, pipeline, dlq, shutdown))
}

/// Consume until the stream ends or `shutdown` fires.
pub async fn run_consumer(
    config: ConsumerConfig,
    bus: Arc<dyn EventBus>,
    pipeline: Arc<InboundPipeline>,
    dlq: Arc<dyn DlqStore>,
    shutdown: ShutdownSignal,
) -> BusResult<ConsumerStats> {
    let mut stream = bus.subscribe(&config.subject).await?;
    tracing::info!(
        subject = %config.subject,
        consumer_group = %config.consumer_group,
        "consumer subscribed"
    );

    let mut stats = ConsumerStats::default();

    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!(subject = %config.subject, "shutdown requested, consumer stopping");
                break;
            }
            next = stream.next() => match next {
                Some(msg) => msg,
                None => {
                    tracing::warn!(subject = %config.subject, "subscription ended");
                    break;
                }
            },
        };

        handle_message(&config, &pipeline, dlq.as_ref(), &msg, &mut stats).await;
    }

    tracing::info!(
        subject = %config.subject,
        processed = stats.processed,
        duplicates = stats.duplicates,
        dead_lettered = stats.dead_lettered,
        "consumer stopped"
    );
    Ok(stats)
}

async fn handle_message(
    config: &ConsumerConfig,
    pipeline: &InboundPipeline,
    dlq: &dyn DlqStore,
    msg: &BusMessage,
    stats: &mut ConsumerStats,
) {
    let envelope = match codec::decode(&msg.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::error!(subject = %msg.subject, error = %e, "undecodable envelope");
            let error = PipelineError::from(e);
            dead_letter(config, dlq, msg, None, &error, 1).await;
            stats.dead_lettered += 1;
            return;
        }
    };

    let span = tracing::info_span!(
        "process_event",
        event_id = %envelope.event_id(),
        event_type = %envelope.event_type(),
        source_service = %envelope.source_service(),
        trace_id = %envelope.trace_id(),
        subject = %msg.subject,
    );

    async {
        let result = retry_classified(
            || pipeline.process(&envelope, Utc::now()),
            &config.retry,
            &config.consumer_group,
            |e: &PipelineError| !e.is_terminal(),
        )
        .await;

        match result {
            Ok(ProcessOutcome::Processed) => stats.processed += 1,
            Ok(ProcessOutcome::Duplicate) => stats.duplicates += 1,
            Err(failure) => {
                tracing::error!(
                    error = %failure.error,
                    reason = failure.error.reason(),
                    retry_count = failure.attempts,
                    "event processing failed, sending to DLQ"
                );
                let attempts = failure.attempts;
                dead_letter(config, dlq, msg, Some(&envelope), &failure.error, attempts).await;
                stats.dead_lettered += 1;
            }
        }
    }
    .instrument(span)
    .await;
}

async fn dead_letter(
    config: &ConsumerConfig,
    dlq: &dyn DlqStore,
    msg: &BusMessage,
    envelope: Option<&EventEnvelope>,
    error: &PipelineError,
    attempts: u32,
) {
    let payload = msg.payload.clone();
    let mut record = DlqRecord::new(msg.subject.clone(), error.to_string(), payload, Utc::now())
        .with_consumer_group(config.consumer_group.clone())
        .with_error_type(error.reason())
        .with_retry_count(attempts as i32);
    if let Some(envelope) = envelope {
        record = record.with_event_id(envelope.event_id());
    }

    if let Err(e) = dlq.create(record).await {
        // Nothing else to fall back to; the broker will redeliver if unacked.
        tracing::error!(subject = %msg.subject, error = %e, "failed to write DLQ record");
    }
}
