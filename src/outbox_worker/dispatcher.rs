use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::context::RequestContext;
use crate::outbox::{SideEffectRecord, SideEffectType};
use crate::publisher::{PublishError, Publisher, SendOptions};

/// Failure reported by an email or audit sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError {
    pub reason: String,
    pub permanent: bool,
}

impl SinkError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            permanent: false,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            permanent: true,
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for SinkError {}

/// Delivers `email` side effects.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, record: &SideEffectRecord) -> Result<(), SinkError>;
}

/// Delivers `audit` side effects.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_audit(&self, record: &SideEffectRecord) -> Result<(), SinkError>;
}

/// A sink that logs email and audit effects, optionally capturing the lines.
#[derive(Clone, Default)]
pub struct LogSink {
    buffer: Option<Arc<Mutex<Vec<String>>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer(buffer: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            buffer: Some(buffer),
        }
    }

    fn write(&self, record: &SideEffectRecord) -> Result<(), SinkError> {
        info!(
            effect_type = %record.effect_type,
            side_effect_id = %record.id,
            tenant_id = %record.tenant_id,
            event_type = %record.event_type,
            "side effect delivered to log sink"
        );
        if let Some(buffer) = &self.buffer {
            buffer
                .lock()
                .map_err(|_| SinkError::transient("log sink buffer poisoned"))?
                .push(format!("[{}] {} {}", record.effect_type, record.event_type, record.payload));
        }
        Ok(())
    }
}

#[async_trait]
impl EmailSender for LogSink {
    async fn send_email(&self, record: &SideEffectRecord) -> Result<(), SinkError> {
        self.write(record)
    }
}

#[async_trait]
impl AuditSink for LogSink {
    async fn record_audit(&self, record: &SideEffectRecord) -> Result<(), SinkError> {
        self.write(record)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("side effect {0} has no destination")]
    MissingDestination(String),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("{effect} sink failed: {source}")]
    Sink {
        effect: SideEffectType,
        #[source]
        source: SinkError,
    },
}

impl DispatchError {
    /// Retrying the same record cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            DispatchError::MissingDestination(_) => true,
            DispatchError::Publish(err) => err.is_permanent(),
            DispatchError::Sink { source, .. } => source.permanent,
        }
    }
}

/// Routes a side effect by its type.
#[derive(Clone)]
pub struct SideEffectDispatcher {
    publisher: Publisher,
    email: Arc<dyn EmailSender>,
    audit: Arc<dyn AuditSink>,
}

impl SideEffectDispatcher {
    pub fn new(publisher: Publisher, email: Arc<dyn EmailSender>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            publisher,
            email,
            audit,
        }
    }

    /// Dispatch `record`, returning the provider message id for queue and
    /// topic effects.
    pub async fn dispatch(&self, record: &SideEffectRecord) -> Result<Option<String>, DispatchError> {
        match record.effect_type {
            SideEffectType::Queue => {
                let queue = Self::destination(record)?;
                let message_id = self
                    .publisher
                    .send(&Self::context(record), queue, &record.event_type, &record.payload, Self::options(record))
                    .await?;
                Ok(Some(message_id))
            }
            SideEffectType::Topic => {
                let topic = Self::destination(record)?;
                let message_id = self
                    .publisher
                    .publish(&Self::context(record), topic, &record.event_type, &record.payload, Self::options(record))
                    .await?;
                Ok(Some(message_id))
            }
            SideEffectType::Email => {
                self.email
                    .send_email(record)
                    .await
                    .map_err(|source| DispatchError::Sink {
                        effect: SideEffectType::Email,
                        source,
                    })?;
                Ok(None)
            }
            SideEffectType::Audit => {
                self.audit
                    .record_audit(record)
                    .await
                    .map_err(|source| DispatchError::Sink {
                        effect: SideEffectType::Audit,
                        source,
                    })?;
                Ok(None)
            }
        }
    }

    fn destination(record: &SideEffectRecord) -> Result<&str, DispatchError> {
        record
            .destination()
            .ok_or_else(|| DispatchError::MissingDestination(record.id.clone()))
    }

    /// The producer's context, rebuilt from what the row captured.
    fn context(record: &SideEffectRecord) -> RequestContext {
        let metadata = &record.metadata;
        let mut ctx = RequestContext::for_tenant(record.tenant_id.clone());
        if let Some(correlation_id) = &metadata.correlation_id {
            ctx = ctx.with_correlation_id(correlation_id.clone());
        }
        if let Some(user_id) = &metadata.user_id {
            ctx = ctx.with_user(user_id.clone());
        }
        if let Some(trace_id) = &metadata.trace_id {
            ctx = ctx.with_trace(trace_id.clone(), None);
        }
        ctx
    }

    fn options(record: &SideEffectRecord) -> SendOptions {
        // Stable across retries of the same row.
        let key = record
            .idempotency_key
            .clone()
            .unwrap_or_else(|| format!("outbox-{}", record.id));
        SendOptions {
            idempotency_key: Some(key),
            deduplication_id: record.metadata.deduplication_id.clone(),
            group_id: record.metadata.group_id.clone(),
            delay_seconds: record.metadata.delay_seconds,
            system: false,
        }
    }
}
