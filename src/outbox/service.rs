use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::{SideEffectMetadata, SideEffectRecord, SideEffectType, StoreError, UnitOfWork};
use crate::config::WorkerConfig;
use crate::context::RequestContext;
use crate::outbox_worker::{JobRequest, JobScheduler};
use crate::publisher::{PublishError, Publisher, SendOptions};

#[derive(Debug, Error)]
pub enum SideEffectError {
    #[error("no tenant in request context")]
    MissingTenant,
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a side effect is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideEffectOptions {
    /// `true` writes an outbox row; `false` sends directly through the
    /// publisher, leaving the dead-letter queue as the only backstop.
    /// Ignored for email and audit effects, which are always critical.
    pub critical: bool,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
    pub delay_seconds: Option<u32>,
    /// Overrides the worker's `max_retries`.
    pub max_retries: Option<u32>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Default for SideEffectOptions {
    fn default() -> Self {
        Self {
            critical: true,
            aggregate_type: None,
            aggregate_id: None,
            idempotency_key: None,
            group_id: None,
            deduplication_id: None,
            delay_seconds: None,
            max_retries: None,
            scheduled_at: None,
        }
    }
}

impl SideEffectOptions {
    pub fn direct() -> Self {
        Self {
            critical: false,
            ..Self::default()
        }
    }

    pub fn aggregate(mut self, aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    fn send_options(&self) -> SendOptions {
        SendOptions {
            idempotency_key: self.idempotency_key.clone(),
            deduplication_id: self.deduplication_id.clone(),
            group_id: self.group_id.clone(),
            delay_seconds: self.delay_seconds,
            system: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SideEffectOutcome {
    /// Staged in the unit of work; dispatched after commit.
    Recorded(SideEffectRecord),
    /// Sent directly, bypassing the outbox.
    Sent { message_id: String },
}

/// Creates side effects for business operations.
///
/// Critical effects become outbox rows staged in the caller's
/// [`UnitOfWork`]; their jobs are enqueued only after the unit commits.
#[derive(Clone)]
pub struct SideEffectService {
    publisher: Publisher,
    scheduler: Arc<dyn JobScheduler>,
    config: WorkerConfig,
}

impl SideEffectService {
    pub fn new(publisher: Publisher, scheduler: Arc<dyn JobScheduler>, config: WorkerConfig) -> Self {
        Self {
            publisher,
            scheduler,
            config,
        }
    }

    #[instrument(skip(self, uow, ctx, payload, options), fields(destination = %queue))]
    pub async fn create_queue_side_effect(
        &self,
        uow: &mut UnitOfWork,
        ctx: &RequestContext,
        queue: &str,
        event_type: &str,
        payload: Value,
        options: SideEffectOptions,
    ) -> Result<SideEffectOutcome, SideEffectError> {
        if !options.critical {
            let message_id = self
                .publisher
                .send(ctx, queue, event_type, &payload, options.send_options())
                .await?;
            return Ok(SideEffectOutcome::Sent { message_id });
        }
        self.publisher.destinations().queue(queue)?;
        self.record(uow, ctx, SideEffectType::Queue, Some(queue), event_type, payload, options)
    }

    #[instrument(skip(self, uow, ctx, payload, options), fields(destination = %topic))]
    pub async fn create_topic_side_effect(
        &self,
        uow: &mut UnitOfWork,
        ctx: &RequestContext,
        topic: &str,
        event_type: &str,
        payload: Value,
        options: SideEffectOptions,
    ) -> Result<SideEffectOutcome, SideEffectError> {
        if !options.critical {
            let message_id = self
                .publisher
                .publish(ctx, topic, event_type, &payload, options.send_options())
                .await?;
            return Ok(SideEffectOutcome::Sent { message_id });
        }
        self.publisher.destinations().topic(topic)?;
        self.record(uow, ctx, SideEffectType::Topic, Some(topic), event_type, payload, options)
    }

    /// Always recorded in the outbox.
    pub fn create_email_side_effect(
        &self,
        uow: &mut UnitOfWork,
        ctx: &RequestContext,
        event_type: &str,
        payload: Value,
        options: SideEffectOptions,
    ) -> Result<SideEffectOutcome, SideEffectError> {
        self.record(uow, ctx, SideEffectType::Email, None, event_type, payload, options)
    }

    /// Always recorded in the outbox.
    pub fn create_audit_side_effect(
        &self,
        uow: &mut UnitOfWork,
        ctx: &RequestContext,
        event_type: &str,
        payload: Value,
        options: SideEffectOptions,
    ) -> Result<SideEffectOutcome, SideEffectError> {
        self.record(uow, ctx, SideEffectType::Audit, None, event_type, payload, options)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        uow: &mut UnitOfWork,
        ctx: &RequestContext,
        effect_type: SideEffectType,
        destination: Option<&str>,
        event_type: &str,
        payload: Value,
        options: SideEffectOptions,
    ) -> Result<SideEffectOutcome, SideEffectError> {
        let tenant_id = ctx.tenant_id().ok_or(SideEffectError::MissingTenant)?;
        if !options.critical && effect_type.is_always_critical() {
            debug!(%effect_type, "non-critical delivery requested; using the outbox");
        }

        let mut record = SideEffectRecord::new(tenant_id, effect_type, event_type, payload)
            .with_max_retries(options.max_retries.unwrap_or(self.config.max_retries))
            .with_metadata(SideEffectMetadata {
                destination: destination.map(str::to_string),
                correlation_id: ctx.correlation_id().map(str::to_string),
                user_id: ctx.user_id().map(str::to_string),
                trace_id: ctx.trace_id().map(str::to_string),
                group_id: options.group_id,
                deduplication_id: options.deduplication_id,
                delay_seconds: options.delay_seconds,
                ..SideEffectMetadata::default()
            });
        record.aggregate_type = options.aggregate_type;
        record.aggregate_id = options.aggregate_id;
        record.idempotency_key = options.idempotency_key;
        if let Some(at) = options.scheduled_at {
            record.scheduled_at = at;
        }

        let scheduler = self.scheduler.clone();
        let request = JobRequest::for_record(&record, &self.config);
        uow.after_commit(async move {
            let job_id = request.job_id.clone();
            // The sweeper re-enqueues rows whose job never started.
            if let Err(err) = scheduler.enqueue(request).await {
                warn!(side_effect_id = %job_id, error = %err, "failed to enqueue side effect");
            }
        });
        uow.stage(record.clone());
        debug!(side_effect_id = %record.id, %effect_type, "side effect recorded");
        Ok(SideEffectOutcome::Recorded(record))
    }
}
