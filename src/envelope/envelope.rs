use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::EnvelopeError;
use crate::context::RequestContext;

pub const DEFAULT_VERSION: &str = "1.0";

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// Delivery metadata carried next to the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    /// Logical destination the message was sent to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    /// Set when the message was replayed from a dead-letter queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reprocessed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_failed_at: Option<DateTime<Utc>>,
}

/// Immutable wrapper around a business payload.
///
/// ```json
/// {
///   "messageId": "0190b6c4-...",
///   "eventType": "order.created",
///   "version": "1.0",
///   "timestamp": "2024-07-01T12:00:00Z",
///   "source": "orders",
///   "tenantId": "acme",
///   "correlationId": "c0ffee",
///   "idempotencyKey": "order-created-42",
///   "payload": { "orderId": 42 },
///   "metadata": { "userId": "user-7" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T = Value> {
    pub message_id: String,
    pub event_type: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: String,
    pub tenant_id: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub payload: T,
    #[serde(default)]
    pub metadata: EnvelopeMetadata,
}

impl<T> Envelope<T> {
    /// Reject envelopes whose identity fields are blank.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.message_id.trim().is_empty() {
            return Err(EnvelopeError::MissingField("messageId"));
        }
        if self.event_type.trim().is_empty() {
            return Err(EnvelopeError::MissingField("eventType"));
        }
        if self.tenant_id.trim().is_empty() {
            return Err(EnvelopeError::MissingField("tenantId"));
        }
        Ok(())
    }

    /// Application-level deduplication key: the idempotency key when set,
    /// otherwise the message id.
    pub fn dedupe_key(&self) -> &str {
        self.idempotency_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .unwrap_or(&self.message_id)
    }

    /// Rebuild the producer's request context from the envelope.
    pub fn request_context(&self) -> RequestContext {
        let mut ctx = RequestContext::for_tenant(self.tenant_id.clone());
        if !self.correlation_id.is_empty() {
            ctx = ctx.with_correlation_id(self.correlation_id.clone());
        }
        if let Some(user_id) = &self.metadata.user_id {
            ctx = ctx.with_user(user_id.clone());
        }
        if let Some(trace_id) = &self.metadata.trace_id {
            ctx = ctx.with_trace(trace_id.clone(), self.metadata.span_id.clone());
        }
        ctx
    }

    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            message_id: self.message_id,
            event_type: self.event_type,
            version: self.version,
            timestamp: self.timestamp,
            source: self.source,
            tenant_id: self.tenant_id,
            correlation_id: self.correlation_id,
            idempotency_key: self.idempotency_key,
            payload: f(self.payload),
            metadata: self.metadata,
        }
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Parse a message body, failing on malformed JSON or blank identity
    /// fields.
    pub fn parse(body: &str) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_str(body).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Serialize(e.to_string()))
    }

    /// Convert the payload to a JSON value.
    pub fn into_value(self) -> Result<Envelope<Value>, EnvelopeError> {
        let payload =
            serde_json::to_value(&self.payload).map_err(|e| EnvelopeError::Serialize(e.to_string()))?;
        Ok(self.map_payload(|_| payload))
    }
}
