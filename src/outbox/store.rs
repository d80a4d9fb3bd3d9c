use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use super::{SideEffectRecord, SideEffectStatus, TransitionError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("outbox storage lock poisoned: {0}")]
    LockPoisoned(&'static str),
    #[error("side effect not found: {0}")]
    NotFound(String),
    #[error("side effect already exists: {0}")]
    Duplicate(String),
    /// A conditional update lost a race with another writer.
    #[error("side effect {id} is {actual}, expected {expected}")]
    Conflict {
        id: String,
        expected: SideEffectStatus,
        actual: SideEffectStatus,
    },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("outbox store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fails the whole commit with [`StoreError::Duplicate`] if the row exists.
    Insert,
    Upsert,
}

/// A business row written in the same transaction as the outbox rows.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityWrite {
    pub collection: String,
    pub id: String,
    pub body: Value,
    pub mode: WriteMode,
}

impl EntityWrite {
    pub fn insert(collection: impl Into<String>, id: impl Into<String>, body: Value) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            body,
            mode: WriteMode::Insert,
        }
    }

    pub fn upsert(collection: impl Into<String>, id: impl Into<String>, body: Value) -> Self {
        Self {
            mode: WriteMode::Upsert,
            ..Self::insert(collection, id, body)
        }
    }

    /// Storage key: `COLLECTION:id`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.collection, self.id)
    }
}

/// Durable storage for side-effect records.
///
/// Every mutation after creation is conditional on the status the caller
/// last observed, so two workers can never both move the same row.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Write `entities` and insert `records` as one transaction. Either every
    /// write lands or none does.
    async fn commit(&self, entities: Vec<EntityWrite>, records: Vec<SideEffectRecord>) -> Result<(), StoreError>;

    /// Insert all records or none of them.
    async fn insert_all(&self, records: Vec<SideEffectRecord>) -> Result<(), StoreError> {
        self.commit(Vec::new(), records).await
    }

    async fn find(&self, id: &str) -> Result<Option<SideEffectRecord>, StoreError>;

    /// Atomically move a `pending` row to `processing`.
    ///
    /// Returns `None` when the row exists but is not pending (claimed by
    /// someone else, or terminal).
    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<SideEffectRecord>, StoreError>;

    /// Replace the stored row, provided its status is still `expected`.
    async fn update(&self, record: &SideEffectRecord, expected: SideEffectStatus) -> Result<(), StoreError>;

    /// Rows in `status`, oldest first.
    async fn find_by_status(&self, status: SideEffectStatus, limit: usize) -> Result<Vec<SideEffectRecord>, StoreError>;

    /// `pending` rows scheduled at or before `now`, earliest schedule first.
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SideEffectRecord>, StoreError>;

    /// `processing` rows claimed before `claimed_before`.
    async fn find_stale_processing(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SideEffectRecord>, StoreError>;

    async fn count_by_status(&self, status: SideEffectStatus) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S: OutboxStore + ?Sized> OutboxStore for Arc<S> {
    async fn commit(&self, entities: Vec<EntityWrite>, records: Vec<SideEffectRecord>) -> Result<(), StoreError> {
        (**self).commit(entities, records).await
    }

    async fn insert_all(&self, records: Vec<SideEffectRecord>) -> Result<(), StoreError> {
        (**self).insert_all(records).await
    }

    async fn find(&self, id: &str) -> Result<Option<SideEffectRecord>, StoreError> {
        (**self).find(id).await
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<SideEffectRecord>, StoreError> {
        (**self).claim(id, now).await
    }

    async fn update(&self, record: &SideEffectRecord, expected: SideEffectStatus) -> Result<(), StoreError> {
        (**self).update(record, expected).await
    }

    async fn find_by_status(&self, status: SideEffectStatus, limit: usize) -> Result<Vec<SideEffectRecord>, StoreError> {
        (**self).find_by_status(status, limit).await
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SideEffectRecord>, StoreError> {
        (**self).find_due(now, limit).await
    }

    async fn find_stale_processing(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SideEffectRecord>, StoreError> {
        (**self).find_stale_processing(claimed_before, limit).await
    }

    async fn count_by_status(&self, status: SideEffectStatus) -> Result<u64, StoreError> {
        (**self).count_by_status(status).await
    }
}
