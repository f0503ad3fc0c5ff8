//! Periodic removal of expired dedup and idempotency entries, and of outbox
//! records sent longer ago than the retention window

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use event_bus::ShutdownSignal;
use event_consumer::DedupStore;
use idempotency::IdempotencyStore;
use outbox::Outbox;
use tokio::task::JoinHandle;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct Sweeper {
    dedup: Arc<dyn DedupStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    outbox: Option<(Arc<dyn Outbox>, TimeDelta)>,
    interval: Duration,
}

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub dedup: u64,
    pub idempotency: u64,
    pub outbox: u64,
}

impl Sweeper {
    pub fn new(dedup: Arc<dyn DedupStore>, idempotency: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            dedup,
            idempotency,
            outbox: None,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Also delete outbox records sent more than `retention` ago.
    pub fn with_outbox(mut self, outbox: Arc<dyn Outbox>, retention: Duration) -> Self {
        let retention = TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX);
        self.outbox = Some((outbox, retention));
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One sweep. A failing store is logged and skipped.
    pub async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        match self.dedup.purge_expired(now).await {
            Ok(n) => report.dedup = n,
            Err(e) => tracing::warn!(error = %e, "dedup purge failed"),
        }
        match self.idempotency.purge_expired(now).await {
            Ok(n) => report.idempotency = n,
            Err(e) => tracing::warn!(error = %e, "idempotency purge failed"),
        }

        if let Some((outbox, retention)) = &self.outbox {
            if let Some(before) = now.checked_sub_signed(*retention) {
                match outbox.purge_sent(before).await {
                    Ok(n) => report.outbox = n,
                    Err(e) => tracing::warn!(error = %e, "outbox purge failed"),
                }
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                dedup = report.dedup,
                idempotency = report.idempotency,
                outbox = report.outbox,
                "expired entries purged"
            );
        }
        report
    }

    pub fn spawn(self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
                self.sweep().await;
            }
            tracing::debug!("sweeper stopped");
        })
    }
}
