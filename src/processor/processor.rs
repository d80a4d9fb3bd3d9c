use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, info_span, Instrument};

use super::{HandlerError, ProcessError};
use crate::bus::ReceivedMessage;
use crate::context::RequestContext;
use crate::envelope::Envelope;
use crate::idempotency::{ExecuteOnceError, Executed, IdempotencyError, IdempotencyStore};
use crate::metrics::DeliveryMetrics;

/// Business logic run for one incoming envelope.
///
/// The returned value is stored with the idempotency record and handed
/// back to callers that hit the same key again.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &RequestContext, envelope: &Envelope) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, ctx: &RequestContext, envelope: &Envelope) -> Result<Value, HandlerError> {
        (**self).handle(ctx, envelope).await
    }
}

/// Per-consumer processing settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Run the handler on every delivery.
    pub skip_idempotency: bool,
    /// Lifetime of the idempotency record; the store default when `None`.
    pub ttl: Option<Duration>,
    /// Idempotency key to use instead of the envelope's dedupe key.
    pub key_override: Option<String>,
}

impl ProcessOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_idempotency(mut self) -> Self {
        self.skip_idempotency = true;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn key_override(mut self, key: impl Into<String>) -> Self {
        self.key_override = Some(key.into());
        self
    }
}

/// Consumer-side processing: parse, establish context, run at most once.
#[derive(Clone)]
pub struct MessageProcessor {
    idempotency: IdempotencyStore,
    metrics: Arc<DeliveryMetrics>,
}

impl MessageProcessor {
    pub fn new(idempotency: IdempotencyStore, metrics: Arc<DeliveryMetrics>) -> Self {
        Self { idempotency, metrics }
    }

    /// Process one message received from `destination`.
    ///
    /// A missing body or a malformed envelope is an error so the message
    /// can reach the dead-letter queue instead of vanishing.
    pub async fn process<H>(
        &self,
        destination: &str,
        message: &ReceivedMessage,
        handler: &H,
        options: &ProcessOptions,
    ) -> Result<Executed<Value>, ProcessError>
    where
        H: MessageHandler + ?Sized,
    {
        let body = message
            .body
            .as_deref()
            .filter(|body| !body.trim().is_empty())
            .ok_or_else(|| ProcessError::EmptyBody(message.message_id.clone()))?;
        let envelope: Envelope = Envelope::parse(body).inspect_err(|err| {
            error!(%destination, message_id = %message.message_id, error = %err, "malformed envelope");
        })?;

        let ctx = envelope.request_context();
        let span = info_span!(
            "process_message",
            %destination,
            tenant_id = %envelope.tenant_id,
            user_id = ctx.user_id().unwrap_or_default(),
            correlation_id = %envelope.correlation_id,
            trace_id = ctx.trace_id().unwrap_or_default(),
            message_id = %envelope.message_id,
            event_type = %envelope.event_type,
        );

        let outcome = self
            .run(&ctx, &envelope, handler, options)
            .instrument(span)
            .await?;

        let duplicate = outcome.is_duplicate();
        if duplicate {
            info!(%destination, message_id = %envelope.message_id, key = %self.key(&envelope, options), "duplicate message skipped");
        }
        self.metrics
            .record_consumed(destination, &envelope.event_type, duplicate);
        Ok(outcome)
    }

    fn key<'a>(&self, envelope: &'a Envelope, options: &'a ProcessOptions) -> &'a str {
        options
            .key_override
            .as_deref()
            .unwrap_or_else(|| envelope.dedupe_key())
    }

    async fn run<H>(
        &self,
        ctx: &RequestContext,
        envelope: &Envelope,
        handler: &H,
        options: &ProcessOptions,
    ) -> Result<Executed<Value>, ProcessError>
    where
        H: MessageHandler + ?Sized,
    {
        if options.skip_idempotency {
            let response = handler
                .handle(ctx, envelope)
                .await
                .map_err(ProcessError::Handler)?;
            return Ok(Executed::Fresh(response));
        }

        self.idempotency
            .execute_once(self.key(envelope, options), || handler.handle(ctx, envelope), options.ttl)
            .await
            .map_err(|err| match err {
                ExecuteOnceError::Operation(err) => ProcessError::Handler(err),
                ExecuteOnceError::Idempotency(IdempotencyError::LockContention { key }) => {
                    ProcessError::LockContention { key }
                }
                ExecuteOnceError::Idempotency(err) => ProcessError::Idempotency(err),
            })
    }
}
