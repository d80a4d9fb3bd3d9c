use chrono::Utc;
use uuid::Uuid;

use super::{Envelope, EnvelopeError, EnvelopeMetadata, DEFAULT_VERSION};
use crate::context::{RequestContext, SYSTEM_TENANT};

/// Stamps payloads with identity, tenant and trace metadata.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    source: String,
    version: String,
}

impl EnvelopeBuilder {
    /// `source` is the producing service name.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            version: DEFAULT_VERSION.to_string(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Build a tenant-scoped envelope; fails when `ctx` has no tenant.
    pub fn create_envelope<T>(
        &self,
        ctx: &RequestContext,
        event_type: &str,
        payload: T,
        idempotency_key: Option<String>,
    ) -> Result<Envelope<T>, EnvelopeError> {
        let tenant_id = ctx.tenant_id().ok_or(EnvelopeError::MissingTenant)?;
        self.build(tenant_id, ctx, event_type, payload, idempotency_key)
    }

    /// Build an envelope for cross-tenant or system traffic. The tenant
    /// defaults to `"system"` when the context carries none.
    pub fn create_system_envelope<T>(
        &self,
        ctx: Option<&RequestContext>,
        event_type: &str,
        payload: T,
        idempotency_key: Option<String>,
    ) -> Result<Envelope<T>, EnvelopeError> {
        let empty = RequestContext::new();
        let ctx = ctx.unwrap_or(&empty);
        let tenant_id = ctx.tenant_id().unwrap_or(SYSTEM_TENANT);
        self.build(tenant_id, ctx, event_type, payload, idempotency_key)
    }

    fn build<T>(
        &self,
        tenant_id: &str,
        ctx: &RequestContext,
        event_type: &str,
        payload: T,
        idempotency_key: Option<String>,
    ) -> Result<Envelope<T>, EnvelopeError> {
        if event_type.trim().is_empty() {
            return Err(EnvelopeError::MissingField("eventType"));
        }
        Ok(Envelope {
            message_id: Uuid::now_v7().to_string(),
            event_type: event_type.to_string(),
            version: self.version.clone(),
            timestamp: Utc::now(),
            source: self.source.clone(),
            tenant_id: tenant_id.to_string(),
            correlation_id: ctx.correlation_id_or_new(),
            idempotency_key: idempotency_key.filter(|key| !key.trim().is_empty()),
            payload,
            metadata: EnvelopeMetadata {
                user_id: ctx.user_id().map(str::to_string),
                trace_id: ctx.trace_id().map(str::to_string),
                span_id: ctx.span_id().map(str::to_string),
                ..Default::default()
            },
        })
    }
}
