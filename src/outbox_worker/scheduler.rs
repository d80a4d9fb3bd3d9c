use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::WorkerConfig;
use crate::outbox::SideEffectRecord;

/// Exponential backoff between job attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay after the `attempt`-th failure (1-based): `base * 2^(attempt-1)`,
    /// capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Wait before the first attempt.
    pub delay: Duration,
    /// Total attempts, including the first.
    pub attempts: u32,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub queue_name: String,
    pub job_name: String,
    /// Re-enqueueing an id that is still active is a no-op.
    pub job_id: String,
    pub payload: Value,
    pub options: JobOptions,
}

impl JobRequest {
    /// The job that dispatches `record`. Its id is the record id.
    ///
    /// The job gets as many attempts as the record has retries left, so the
    /// job and the row run out at the same failure.
    pub fn for_record(record: &SideEffectRecord, config: &WorkerConfig) -> Self {
        let delay = (record.scheduled_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        Self {
            queue_name: config.queue_name.clone(),
            job_name: config.job_name.clone(),
            job_id: record.id.clone(),
            payload: json!({
                "sideEffectId": record.id,
                "tenantId": record.tenant_id,
                "effectType": record.effect_type,
            }),
            options: JobOptions {
                delay,
                attempts: record.max_retries.saturating_sub(record.retry_count).max(1),
                backoff: BackoffPolicy {
                    base: config.backoff_base(),
                    max: config.backoff_max(),
                },
            },
        }
    }
}

/// One delivery of a job to its handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub payload: Value,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Try again after the backoff delay, if attempts remain.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Stop retrying.
    #[error("permanent: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("scheduler is shut down")]
    ShutDown,
    #[error("unknown job queue `{0}`")]
    UnknownQueue(String),
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

/// Invoked at least once per enqueued job, with the attempt count.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// Job queue runtime consumed by the outbox.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Enqueue a job, returning its id.
    async fn enqueue(&self, request: JobRequest) -> Result<String, SchedulerError>;
}

#[async_trait]
impl<S: JobScheduler + ?Sized> JobScheduler for Arc<S> {
    async fn enqueue(&self, request: JobRequest) -> Result<String, SchedulerError> {
        (**self).enqueue(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::SideEffectType;

    #[test]
    fn backoff_doubles_until_capped() {
        let backoff = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
        };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(64), Duration::from_secs(5));
    }

    #[test]
    fn record_job_uses_record_id_and_worker_settings() {
        let record = SideEffectRecord::new("acme", SideEffectType::Email, "email.welcome", json!({}));
        let config = WorkerConfig::default();
        let request = JobRequest::for_record(&record, &config);

        assert_eq!(request.job_id, record.id);
        assert_eq!(request.queue_name, "side-effects");
        assert_eq!(request.job_name, "process-side-effect");
        assert_eq!(request.options.attempts, 3);
        assert_eq!(request.options.delay, Duration::ZERO);
        assert_eq!(request.payload["effectType"], "email");
    }

    #[test]
    fn attempts_follow_the_record_ceiling() {
        let mut record = SideEffectRecord::new("acme", SideEffectType::Queue, "x", json!({})).with_max_retries(5);
        let config = WorkerConfig::default();
        assert_eq!(JobRequest::for_record(&record, &config).options.attempts, 5);

        // A rescued row only has its remaining retries.
        record.retry_count = 4;
        assert_eq!(JobRequest::for_record(&record, &config).options.attempts, 1);
        record.retry_count = 9;
        assert_eq!(JobRequest::for_record(&record, &config).options.attempts, 1);
    }

    #[test]
    fn future_schedule_becomes_delay() {
        let record = SideEffectRecord::new("acme", SideEffectType::Queue, "x", json!({}))
            .with_scheduled_at(Utc::now() + chrono::Duration::minutes(5));
        let request = JobRequest::for_record(&record, &WorkerConfig::default());
        assert!(request.options.delay > Duration::from_secs(4 * 60));
    }
}
