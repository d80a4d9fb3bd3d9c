use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{HandlerError, MessageHandler};
use crate::context::RequestContext;
use crate::envelope::Envelope;

/// Listener for one or more event types.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &RequestContext, envelope: &Envelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn handle(&self, ctx: &RequestContext, envelope: &Envelope) -> Result<(), HandlerError> {
        (**self).handle(ctx, envelope).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that ran successfully, in invocation order.
    pub handled: Vec<String>,
    /// Handler name and error for each failure.
    pub failed: Vec<(String, HandlerError)>,
}

/// Routes envelopes to handlers by event type.
///
/// Handlers registered with [`on_all`](Self::on_all) see every event and run
/// after the type-specific ones. A failing handler is logged and reported;
/// it never stops the handlers after it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_type: BTreeMap<String, Vec<Arc<dyn EventHandler>>>,
    wildcard: Vec<Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.by_type.entry(event_type.into()).or_default().push(handler);
        self
    }

    pub fn on_all(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.wildcard.push(handler);
        self
    }

    pub fn handlers_for(&self, event_type: &str) -> impl Iterator<Item = &Arc<dyn EventHandler>> {
        self.by_type
            .get(event_type)
            .into_iter()
            .flatten()
            .chain(self.wildcard.iter())
    }

    pub async fn dispatch(&self, ctx: &RequestContext, envelope: &Envelope) -> DispatchReport {
        let mut report = DispatchReport::default();
        for handler in self.handlers_for(&envelope.event_type) {
            match handler.handle(ctx, envelope).await {
                Ok(()) => report.handled.push(handler.name().to_string()),
                Err(err) => {
                    warn!(
                        handler = handler.name(),
                        event_type = %envelope.event_type,
                        message_id = %envelope.message_id,
                        error = %err,
                        "event handler failed"
                    );
                    report.failed.push((handler.name().to_string(), err));
                }
            }
        }
        if report.handled.is_empty() && report.failed.is_empty() {
            debug!(event_type = %envelope.event_type, "no handlers registered");
        }
        report
    }
}

/// Handler failures are isolated, so a dispatch always counts as handled.
#[async_trait]
impl MessageHandler for HandlerRegistry {
    async fn handle(&self, ctx: &RequestContext, envelope: &Envelope) -> Result<Value, HandlerError> {
        let report = self.dispatch(ctx, envelope).await;
        Ok(json!({
            "handled": report.handled,
            "failed": report.failed.iter().map(|(name, _)| name).collect::<Vec<_>>(),
        }))
    }
}
