//! HashMap-backed outbox store for tests and single-process use.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{EntityWrite, OutboxStore, SideEffectRecord, SideEffectStatus, StoreError, WriteMode};

#[derive(Default)]
struct Tables {
    rows: BTreeMap<String, SideEffectRecord>,
    /// Business rows keyed by `COLLECTION:id`.
    entities: BTreeMap<String, Value>,
}

/// In-memory outbox table keyed by record id, next to a generic table of
/// business rows.
///
/// Both tables sit behind one lock, so a commit applies its entity writes
/// and outbox rows together or not at all. The claim compare-and-set runs
/// under the write lock, the equivalent of
/// `UPDATE ... SET status = 'processing' WHERE id = $1 AND status = 'pending'`.
/// Every status written is appended to a history log for inspection.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    tables: Arc<RwLock<Tables>>,
    history: Arc<RwLock<Vec<(String, SideEffectStatus)>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a database outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("outbox store offline".into()));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.ensure_available()?;
        self.tables
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.ensure_available()?;
        self.tables
            .write()
            .map_err(|_| StoreError::LockPoisoned("outbox write"))
    }

    fn log(&self, id: &str, status: SideEffectStatus) -> Result<(), StoreError> {
        self.history
            .write()
            .map_err(|_| StoreError::LockPoisoned("history write"))?
            .push((id.to_string(), status));
        Ok(())
    }

    /// Statuses written for `id`, in order.
    pub fn status_history(&self, id: &str) -> Vec<SideEffectStatus> {
        self.history
            .read()
            .map(|log| {
                log.iter()
                    .filter(|(row, _)| row == id)
                    .map(|(_, status)| *status)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The business row committed under `collection`/`id`.
    pub fn entity(&self, collection: &str, id: &str) -> Option<Value> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.entities.get(&format!("{collection}:{id}")).cloned())
    }

    pub fn entity_count(&self) -> usize {
        self.tables.read().map(|t| t.entities.len()).unwrap_or(0)
    }

    pub fn all(&self) -> Vec<SideEffectRecord> {
        self.tables
            .read()
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn commit(&self, entities: Vec<EntityWrite>, records: Vec<SideEffectRecord>) -> Result<(), StoreError> {
        let mut tables = self.write()?;

        // Check every precondition before touching either table.
        if let Some(existing) = entities
            .iter()
            .filter(|e| e.mode == WriteMode::Insert)
            .map(EntityWrite::key)
            .find(|key| tables.entities.contains_key(key))
        {
            return Err(StoreError::Duplicate(existing));
        }
        if let Some(existing) = records.iter().find(|r| tables.rows.contains_key(&r.id)) {
            return Err(StoreError::Duplicate(existing.id.clone()));
        }

        for entity in entities {
            tables.entities.insert(entity.key(), entity.body);
        }
        for record in records {
            self.log(&record.id, record.status)?;
            tables.rows.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<SideEffectRecord>, StoreError> {
        Ok(self.read()?.rows.get(id).cloned())
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<SideEffectRecord>, StoreError> {
        let mut tables = self.write()?;
        let row = tables
            .rows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !row.is_pending() {
            return Ok(None);
        }
        row.claim(now)?;
        let claimed = row.clone();
        self.log(id, claimed.status)?;
        Ok(Some(claimed))
    }

    async fn update(&self, record: &SideEffectRecord, expected: SideEffectStatus) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let row = tables
            .rows
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        if row.status != expected {
            return Err(StoreError::Conflict {
                id: record.id.clone(),
                expected,
                actual: row.status,
            });
        }
        *row = record.clone();
        self.log(&record.id, record.status)?;
        Ok(())
    }

    async fn find_by_status(&self, status: SideEffectStatus, limit: usize) -> Result<Vec<SideEffectRecord>, StoreError> {
        let tables = self.read()?;
        let mut found: Vec<_> = tables.rows.values().filter(|r| r.status == status).cloned().collect();
        found.sort_by_key(|r| r.created_at);
        found.truncate(limit);
        Ok(found)
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SideEffectRecord>, StoreError> {
        let tables = self.read()?;
        let mut due: Vec<_> = tables
            .rows
            .values()
            .filter(|r| r.is_pending() && r.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.scheduled_at, r.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn find_stale_processing(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SideEffectRecord>, StoreError> {
        let tables = self.read()?;
        let mut stale: Vec<_> = tables
            .rows
            .values()
            .filter(|r| r.is_processing() && r.claimed_at.is_some_and(|at| at < claimed_before))
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.claimed_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn count_by_status(&self, status: SideEffectStatus) -> Result<u64, StoreError> {
        Ok(self.read()?.rows.values().filter(|r| r.status == status).count() as u64)
    }
}
