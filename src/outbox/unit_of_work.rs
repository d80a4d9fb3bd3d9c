//! UnitOfWork - stage business rows, outbox rows and after-commit work for
//! one transaction.
//!
//! ## Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(store.clone());
//! uow.write(EntityWrite::insert("orders", &order.id, serde_json::to_value(&order)?));
//! service.create_queue_side_effect(&mut uow, &ctx, "orders", "order.created", payload, options).await?;
//! uow.commit().await?; // order and side effect written together, then jobs enqueued
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use super::{EntityWrite, OutboxStore, SideEffectRecord, StoreError};

/// Collects business writes, side-effect rows and deferred callbacks for a
/// single business transaction.
///
/// `commit` hands the business writes and the staged rows to one
/// [`OutboxStore::commit`], so the side effect exists exactly when the change
/// that caused it does. Callbacks run only after that write succeeds, in
/// registration order. `rollback`, or dropping the unit uncommitted,
/// discards everything.
pub struct UnitOfWork {
    store: Arc<dyn OutboxStore>,
    entities: Vec<EntityWrite>,
    staged: Vec<SideEffectRecord>,
    after_commit: Vec<BoxFuture<'static, ()>>,
    finished: bool,
}

impl UnitOfWork {
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self {
            store,
            entities: Vec::new(),
            staged: Vec::new(),
            after_commit: Vec::new(),
            finished: false,
        }
    }

    /// Stage a business row to commit with the side effects.
    pub fn write(&mut self, entity: EntityWrite) {
        self.entities.push(entity);
    }

    pub fn stage(&mut self, record: SideEffectRecord) {
        self.staged.push(record);
    }

    /// Defer `callback` until after a successful commit.
    pub fn after_commit<F>(&mut self, callback: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.after_commit.push(callback.boxed());
    }

    pub fn staged(&self) -> &[SideEffectRecord] {
        &self.staged
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.staged.is_empty() && self.after_commit.is_empty()
    }

    /// Persist the business writes and staged rows, then flush the
    /// after-commit callbacks.
    ///
    /// When the store rejects the commit nothing is written and no callback
    /// runs.
    pub async fn commit(mut self) -> Result<Vec<SideEffectRecord>, StoreError> {
        self.finished = true;
        let entities = std::mem::take(&mut self.entities);
        let staged = std::mem::take(&mut self.staged);
        let callbacks = std::mem::take(&mut self.after_commit);
        let written = entities.len();

        if written > 0 || !staged.is_empty() {
            self.store.commit(entities, staged.clone()).await?;
        }
        debug!(
            entities = written,
            records = staged.len(),
            callbacks = callbacks.len(),
            "unit of work committed"
        );

        for callback in callbacks {
            callback.await;
        }
        Ok(staged)
    }

    pub fn rollback(mut self) {
        self.finished = true;
        debug!(
            entities = self.entities.len(),
            records = self.staged.len(),
            callbacks = self.after_commit.len(),
            "unit of work rolled back"
        );
        self.entities.clear();
        self.staged.clear();
        self.after_commit.clear();
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if !self.finished && !self.is_empty() {
            warn!(
                records = self.staged.len(),
                callbacks = self.after_commit.len(),
                "unit of work dropped without commit; discarding"
            );
        }
    }
}
