use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, instrument, warn};

use super::{Job, JobError, JobHandler, SideEffectDispatcher};
use crate::metrics::DeliveryMetrics;
use crate::outbox::{OutboxStore, SideEffectStatus, StoreError};

/// Result of a batch drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainResult {
    pub claimed: usize,
    pub completed: usize,
    pub released: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed { message_id: Option<String> },
    /// Dispatch failed and the row went back to `pending`.
    Released { retry_count: u32, error: String },
    /// The row reached `failed` and will not be dispatched again.
    Failed { error: String },
    /// The row was not pending, so another worker owns it or it is done.
    Skipped { status: SideEffectStatus },
}

/// Drains outbox rows: claim, dispatch, then record the outcome.
///
/// Each row is claimed with a conditional `pending -> processing` update
/// that is persisted before dispatch, so a crash mid-dispatch leaves the row
/// visibly `processing` for the sweeper. Every later write is conditional on
/// `processing`.
pub struct OutboxWorker {
    store: Arc<dyn OutboxStore>,
    dispatcher: SideEffectDispatcher,
    metrics: Arc<DeliveryMetrics>,
    batch_size: usize,
}

impl OutboxWorker {
    pub fn new(store: Arc<dyn OutboxStore>, dispatcher: SideEffectDispatcher, metrics: Arc<DeliveryMetrics>) -> Self {
        Self {
            store,
            dispatcher,
            metrics,
            batch_size: 10,
        }
    }

    /// Max rows per `drain`.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Process the row with `id`.
    #[instrument(skip_all, fields(side_effect_id = %id))]
    pub async fn process_record(&self, id: &str) -> Result<ProcessOutcome, StoreError> {
        let Some(mut record) = self.store.claim(id, Utc::now()).await? else {
            let status = self
                .store
                .find(id)
                .await?
                .map(|r| r.status)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            debug!(%status, "side effect not pending; skipping");
            return Ok(ProcessOutcome::Skipped { status });
        };
        let effect_type = record.effect_type.as_str();

        match self.dispatcher.dispatch(&record).await {
            Ok(message_id) => {
                record.complete(Utc::now())?;
                self.store.update(&record, SideEffectStatus::Processing).await?;
                self.metrics.record_dispatch(effect_type, "completed");
                debug!(?message_id, "side effect completed");
                Ok(ProcessOutcome::Completed { message_id })
            }
            Err(err) if err.is_permanent() => {
                let error = err.to_string();
                record.fail(error.clone())?;
                self.store.update(&record, SideEffectStatus::Processing).await?;
                self.metrics.record_dispatch(effect_type, "failed");
                error!(%error, retry_count = record.retry_count, "side effect failed permanently");
                Ok(ProcessOutcome::Failed { error })
            }
            Err(err) => {
                let error = err.to_string();
                let status = record.record_failure(error.clone())?;
                self.store.update(&record, SideEffectStatus::Processing).await?;
                if status == SideEffectStatus::Failed {
                    self.metrics.record_dispatch(effect_type, "failed");
                    error!(
                        %error,
                        retry_count = record.retry_count,
                        max_retries = record.max_retries,
                        "side effect retries exhausted"
                    );
                    Ok(ProcessOutcome::Failed { error })
                } else {
                    self.metrics.record_dispatch(effect_type, "released");
                    warn!(%error, retry_count = record.retry_count, "side effect released for retry");
                    Ok(ProcessOutcome::Released {
                        retry_count: record.retry_count,
                        error,
                    })
                }
            }
        }
    }

    /// Process up to `batch_size` due pending rows, earliest schedule first.
    ///
    /// Rows waiting out a later `scheduled_at` are not fetched, so they never
    /// hold back rows that are due now.
    pub async fn drain(&self) -> Result<DrainResult, StoreError> {
        let due = self.store.find_due(Utc::now(), self.batch_size).await?;

        let mut result = DrainResult::default();
        for record in &due {
            match self.process_record(&record.id).await? {
                ProcessOutcome::Completed { .. } => {
                    result.claimed += 1;
                    result.completed += 1;
                }
                ProcessOutcome::Released { .. } => {
                    result.claimed += 1;
                    result.released += 1;
                }
                ProcessOutcome::Failed { .. } => {
                    result.claimed += 1;
                    result.failed += 1;
                }
                ProcessOutcome::Skipped { .. } => result.skipped += 1,
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl JobHandler for OutboxWorker {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match self.process_record(&job.id).await {
            Ok(ProcessOutcome::Released { error, .. }) => Err(JobError::Retryable(error)),
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(id)) => Err(JobError::Permanent(format!("side effect {id} not found"))),
            Err(err) => Err(JobError::Retryable(err.to_string())),
        }
    }
}
