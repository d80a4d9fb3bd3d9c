use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{JobRequest, JobScheduler};
use crate::config::WorkerConfig;
use crate::outbox::{OutboxStore, SideEffectRecord, SideEffectStatus, StoreError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Stuck `processing` rows returned to `pending`.
    pub rescued: usize,
    /// Stuck rows whose lost attempt used up their retries.
    pub failed: usize,
    /// Pending rows handed to the scheduler again.
    pub requeued: usize,
}

/// Periodic repair of rows a crashed worker or a lost job left behind.
///
/// A row stuck in `processing` longer than `processing_timeout` has its
/// lost attempt counted and goes back to `pending` (or `failed` when that
/// was its last retry). A `pending` row scheduled more than `orphan_after`
/// ago is enqueued again; the scheduler ignores ids it is already running.
#[derive(Clone)]
pub struct OutboxSweeper {
    store: Arc<dyn OutboxStore>,
    scheduler: Arc<dyn JobScheduler>,
    config: WorkerConfig,
}

impl OutboxSweeper {
    pub fn new(store: Arc<dyn OutboxStore>, scheduler: Arc<dyn JobScheduler>, config: WorkerConfig) -> Self {
        Self {
            store,
            scheduler,
            config,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let limit = self.config.sweep_batch_size;

        let timeout = chrono::Duration::from_std(self.config.processing_timeout()).unwrap_or(chrono::Duration::MAX);
        let stale = self
            .store
            .find_stale_processing(now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC), limit)
            .await?;
        for mut record in stale {
            let status = record.record_failure("processing timed out")?;
            match self.store.update(&record, SideEffectStatus::Processing).await {
                Ok(()) => {}
                Err(StoreError::Conflict { .. }) => {
                    debug!(side_effect_id = %record.id, "row moved while sweeping");
                    continue;
                }
                Err(err) => return Err(err),
            }
            if status == SideEffectStatus::Failed {
                report.failed += 1;
                error!(side_effect_id = %record.id, retry_count = record.retry_count, "stuck side effect failed");
            } else {
                report.rescued += 1;
                warn!(side_effect_id = %record.id, retry_count = record.retry_count, "stuck side effect rescued");
                self.enqueue(&record).await;
            }
        }

        let orphan_after = chrono::Duration::from_std(self.config.orphan_after()).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(orphan_after).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let pending = self
            .store
            .find_by_status(SideEffectStatus::Pending, limit)
            .await?;
        for record in pending.iter().filter(|r| r.scheduled_at < cutoff) {
            if self.enqueue(record).await {
                report.requeued += 1;
            }
        }

        if report != SweepReport::default() {
            info!(
                rescued = report.rescued,
                failed = report.failed,
                requeued = report.requeued,
                "outbox sweep finished"
            );
        }
        Ok(report)
    }

    async fn enqueue(&self, record: &SideEffectRecord) -> bool {
        match self
            .scheduler
            .enqueue(JobRequest::for_record(record, &self.config))
            .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!(side_effect_id = %record.id, error = %err, "failed to enqueue side effect");
                false
            }
        }
    }

    /// Sweep every `sweep_interval` until `shutdown` turns true or its
    /// sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            warn!(error = %err, "outbox sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("outbox sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
