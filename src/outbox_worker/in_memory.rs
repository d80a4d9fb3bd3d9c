use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{Job, JobError, JobHandler, JobRequest, JobScheduler, SchedulerError, TokenBucket};
use crate::config::WorkerConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub enqueued: u64,
    /// Enqueues ignored because the job id was still active.
    pub deduplicated: u64,
    pub completed: u64,
    pub failed: u64,
    /// Attempts that failed and were scheduled again.
    pub retried: u64,
}

struct SchedulerInner {
    queue_name: String,
    handler: Arc<dyn JobHandler>,
    permits: Semaphore,
    limiter: TokenBucket,
    active: Mutex<HashSet<String>>,
    stats: Mutex<SchedulerStats>,
    in_flight: AtomicUsize,
    idle: Notify,
    shut_down: AtomicBool,
}

impl SchedulerInner {
    fn stats(&self) -> std::sync::MutexGuard<'_, SchedulerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, job_id: &str) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// In-process job runtime.
///
/// Runs at most `concurrency` handler calls at once, starts no more than
/// `rate_limit_max` per `rate_limit_window`, and retries retryable failures
/// with exponential backoff until the job's attempts are used up.
#[derive(Clone)]
pub struct InMemoryJobScheduler {
    inner: Arc<SchedulerInner>,
}

impl InMemoryJobScheduler {
    pub fn new(config: &WorkerConfig, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queue_name: config.queue_name.clone(),
                handler,
                permits: Semaphore::new(config.concurrency.max(1)),
                limiter: TokenBucket::new(config.rate_limit_max, config.rate_limit_window()),
                active: Mutex::new(HashSet::new()),
                stats: Mutex::new(SchedulerStats::default()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        *self.inner.stats()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once no job is waiting, running or backing off.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Refuse new jobs and stop starting attempts of queued ones.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.inner.permits.close();
    }

    async fn run(inner: Arc<SchedulerInner>, request: JobRequest) {
        if !request.options.delay.is_zero() {
            sleep(request.options.delay).await;
        }

        let max_attempts = request.options.attempts.max(1);
        for attempt in 1..=max_attempts {
            let outcome = {
                let Ok(_permit) = inner.permits.acquire().await else {
                    debug!(job_id = %request.job_id, "scheduler closed; dropping job");
                    break;
                };
                inner.limiter.acquire().await;
                let job = Job {
                    id: request.job_id.clone(),
                    name: request.job_name.clone(),
                    payload: request.payload.clone(),
                    attempt,
                    max_attempts,
                };
                inner.handler.handle(&job).await
            };

            match outcome {
                Ok(()) => {
                    inner.stats().completed += 1;
                    debug!(job_id = %request.job_id, attempt, "job completed");
                    break;
                }
                Err(JobError::Permanent(reason)) => {
                    inner.stats().failed += 1;
                    warn!(job_id = %request.job_id, attempt, %reason, "job failed permanently");
                    break;
                }
                Err(JobError::Retryable(reason)) if attempt < max_attempts => {
                    inner.stats().retried += 1;
                    let delay = request.options.backoff.delay_for(attempt);
                    debug!(job_id = %request.job_id, attempt, ?delay, %reason, "job will retry");
                    sleep(delay).await;
                }
                Err(JobError::Retryable(reason)) => {
                    inner.stats().failed += 1;
                    warn!(job_id = %request.job_id, attempt, %reason, "job attempts exhausted");
                }
            }
        }

        inner.finish(&request.job_id);
    }
}

#[async_trait]
impl JobScheduler for InMemoryJobScheduler {
    async fn enqueue(&self, request: JobRequest) -> Result<String, SchedulerError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShutDown);
        }
        if request.queue_name != self.inner.queue_name {
            return Err(SchedulerError::UnknownQueue(request.queue_name));
        }

        let job_id = request.job_id.clone();
        let fresh = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.clone());
        if !fresh {
            self.inner.stats().deduplicated += 1;
            debug!(%job_id, "job already active");
            return Ok(job_id);
        }

        self.inner.stats().enqueued += 1;
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(Self::run(self.inner.clone(), request));
        Ok(job_id)
    }
}
