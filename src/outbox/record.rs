use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// What a side effect does once dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffectType {
    Queue,
    Topic,
    Email,
    Audit,
}

impl SideEffectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffectType::Queue => "queue",
            SideEffectType::Topic => "topic",
            SideEffectType::Email => "email",
            SideEffectType::Audit => "audit",
        }
    }

    /// Email and audit effects always go through the outbox.
    pub fn is_always_critical(&self) -> bool {
        matches!(self, SideEffectType::Email | SideEffectType::Audit)
    }
}

impl fmt::Display for SideEffectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an outbox row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffectStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SideEffectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffectStatus::Pending => "pending",
            SideEffectStatus::Processing => "processing",
            SideEffectStatus::Completed => "completed",
            SideEffectStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SideEffectStatus::Completed | SideEffectStatus::Failed)
    }
}

impl fmt::Display for SideEffectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {action} a side effect in status {from}")]
pub struct TransitionError {
    pub from: SideEffectStatus,
    pub action: &'static str,
}

/// Routing and tracing details captured when the side effect was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffectMetadata {
    /// Logical queue or topic name for `queue`/`topic` effects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// A durable side effect, written in the same transaction as the business
/// change that produced it.
///
/// Status only moves `pending -> processing -> {completed | pending | failed}`
/// and `retry_count` only grows. `failed` and `completed` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffectRecord {
    pub id: String,
    pub tenant_id: String,
    pub effect_type: SideEffectType,
    #[serde(default)]
    pub status: SideEffectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,
    pub event_type: String,
    pub payload: Value,
    #[serde(default)]
    pub metadata: SideEffectMetadata,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl SideEffectRecord {
    pub fn new(
        tenant_id: impl Into<String>,
        effect_type: SideEffectType,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            tenant_id: tenant_id.into(),
            effect_type,
            status: SideEffectStatus::Pending,
            aggregate_type: None,
            aggregate_id: None,
            event_type: event_type.into(),
            payload,
            metadata: SideEffectMetadata::default(),
            scheduled_at: now,
            created_at: now,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            processed_at: None,
            claimed_at: None,
            idempotency_key: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.metadata.destination = Some(destination.into());
        self
    }

    pub fn with_aggregate(mut self, aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = scheduled_at;
        self
    }

    pub fn with_metadata(mut self, metadata: SideEffectMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn destination(&self) -> Option<&str> {
        self.metadata.destination.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.status == SideEffectStatus::Pending
    }

    pub fn is_processing(&self) -> bool {
        self.status == SideEffectStatus::Processing
    }

    pub fn is_completed(&self) -> bool {
        self.status == SideEffectStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == SideEffectStatus::Failed
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    fn require(&self, status: SideEffectStatus, action: &'static str) -> Result<(), TransitionError> {
        if self.status == status {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                action,
            })
        }
    }

    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(SideEffectStatus::Pending, "claim")?;
        self.status = SideEffectStatus::Processing;
        self.claimed_at = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(SideEffectStatus::Processing, "complete")?;
        self.status = SideEffectStatus::Completed;
        self.processed_at = Some(now);
        self.claimed_at = None;
        Ok(())
    }

    /// Count a failed attempt. Returns the resulting status: `pending` while
    /// retries remain, `failed` once `retry_count` reaches `max_retries`.
    pub fn record_failure(&mut self, error: impl Into<String>) -> Result<SideEffectStatus, TransitionError> {
        self.require(SideEffectStatus::Processing, "retry")?;
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.claimed_at = None;
        self.status = if self.retries_exhausted() {
            SideEffectStatus::Failed
        } else {
            SideEffectStatus::Pending
        };
        Ok(self.status)
    }

    /// Fail without further retries, counting the attempt.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.require(SideEffectStatus::Processing, "fail")?;
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.claimed_at = None;
        self.status = SideEffectStatus::Failed;
        Ok(())
    }
}
