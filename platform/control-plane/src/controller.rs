//! DLQ inspection and replay
//!
//! Replay re-dispatches each selected record through the relay's domain sink.
//! A record is marked replayed only after the sink accepted it, and at most
//! once: concurrent replays of the same record publish it at most twice but
//! count it once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dlq::{DlqQuery, DlqRecord, DlqStore};
use event_bus::StoreError;
use outbox::{DomainSink, Outbox};
use platform_http_contracts::ApiError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("DLQ record {0} not found")]
    NotFound(Uuid),

    #[error("DLQ store error: {0}")]
    Store(#[from] StoreError),
}

impl From<ControllerError> for ApiError {
    fn from(e: ControllerError) -> Self {
        match &e {
            ControllerError::NotFound(_) => ApiError::not_found(e.to_string()),
            ControllerError::Store(err) if err.is_transient() => ApiError::transient(e.to_string()),
            ControllerError::Store(_) => ApiError::internal(e.to_string()),
        }
    }
}

/// Which records to replay. Explicit `ids` take precedence over the filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFilter {
    #[serde(default)]
    pub ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub source_topic: Option<String>,
    #[serde(default)]
    pub consumer_group: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl ReplayFilter {
    fn as_query(&self) -> DlqQuery {
        DlqQuery {
            source_topic: self.source_topic.clone(),
            consumer_group: self.consumer_group.clone(),
            error_type: self.error_type.clone(),
            include_replayed: false,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFailure {
    pub id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub requested: usize,
    pub replayed: usize,
    pub failed: usize,
    /// Already replayed by a concurrent request
    pub skipped: usize,
    pub replayed_ids: Vec<Uuid>,
    pub failures: Vec<ReplayFailure>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

pub struct DlqController {
    dlq: Arc<dyn DlqStore>,
    sink: Arc<dyn DomainSink>,
    outbox: Option<Arc<dyn Outbox>>,
}

impl DlqController {
    pub fn new(dlq: Arc<dyn DlqStore>, sink: Arc<dyn DomainSink>) -> Self {
        Self { dlq, sink, outbox: None }
    }

    /// After a successful replay, settle the parked outbox record as well.
    pub fn with_outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn store(&self) -> &Arc<dyn DlqStore> {
        &self.dlq
    }

    pub async fn query(&self, query: &DlqQuery) -> Result<Vec<DlqRecord>, ControllerError> {
        Ok(self.dlq.query(query).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<DlqRecord, ControllerError> {
        self.dlq.get(id).await?.ok_or(ControllerError::NotFound(id))
    }

    async fn select(&self, filter: &ReplayFilter) -> Result<Vec<DlqRecord>, ControllerError> {
        let Some(ids) = &filter.ids else {
            return self.query(&filter.as_query()).await;
        };

        let query = filter.as_query();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.dlq.get(*id).await? {
                if query.matches(&record) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    pub async fn replay(&self, filter: &ReplayFilter) -> Result<ReplayReport, ControllerError> {
        let started_at = Utc::now();
        let records = self.select(filter).await?;

        let mut report = ReplayReport {
            requested: records.len(),
            replayed: 0,
            failed: 0,
            skipped: 0,
            replayed_ids: Vec::new(),
            failures: Vec::new(),
            started_at,
            ended_at: started_at,
        };

        for record in records {
            match self.replay_one(&record).await {
                Ok(true) => {
                    report.replayed += 1;
                    report.replayed_ids.push(record.id);
                }
                Ok(false) => report.skipped += 1,
                Err(error) => {
                    tracing::warn!(dlq_id = %record.id, error = %error, "DLQ replay failed");
                    report.failed += 1;
                    report.failures.push(ReplayFailure { id: record.id, error });
                }
            }
        }

        report.ended_at = Utc::now();
        tracing::info!(
            requested = report.requested,
            replayed = report.replayed,
            failed = report.failed,
            skipped = report.skipped,
            "DLQ replay finished"
        );
        Ok(report)
    }

    /// Ok(true) when this call marked the record replayed.
    async fn replay_one(&self, record: &DlqRecord) -> Result<bool, String> {
        let envelope = record.envelope().map_err(|e| format!("stored event is unreadable: {e}"))?;
        self.sink
            .publish(&envelope)
            .await
            .map_err(|e| e.to_string())?;

        let now = Utc::now();
        let marked = self
            .dlq
            .mark_replayed(&[record.id], now)
            .await
            .map_err(|e| format!("published but not marked: {e}"))?;
        if !marked.contains(&record.id) {
            return Ok(false);
        }

        if let Some(outbox) = &self.outbox {
            if let Err(e) = outbox.mark_sent_by_event_id(envelope.event_id(), now).await {
                tracing::warn!(
                    dlq_id = %record.id,
                    event_id = %envelope.event_id(),
                    error = %e,
                    "failed to settle outbox record after replay"
                );
            }
        }

        tracing::info!(
            dlq_id = %record.id,
            event_id = %envelope.event_id(),
            event_type = %envelope.event_type(),
            "DLQ record replayed"
        );
        Ok(true)
    }
}
