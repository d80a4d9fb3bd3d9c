use thiserror::Error;

use crate::cache::CacheError;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// The cache could not be read or written; never treated as "not found".
    #[error("idempotency cache failure: {0}")]
    Cache(#[from] CacheError),
    #[error("failed to encode idempotency record for `{key}`: {reason}")]
    Encode { key: String, reason: String },
    /// Another caller holds the lock and has not finished within the retry window.
    #[error("lock contention on idempotency key `{key}`")]
    LockContention { key: String },
}

/// Failure of [`IdempotencyStore::execute_once`](super::IdempotencyStore::execute_once):
/// either the bookkeeping or the wrapped operation itself.
#[derive(Debug, Error)]
pub enum ExecuteOnceError<E> {
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error("operation failed: {0}")]
    Operation(E),
}

impl<E> ExecuteOnceError<E> {
    pub fn is_lock_contention(&self) -> bool {
        matches!(
            self,
            ExecuteOnceError::Idempotency(IdempotencyError::LockContention { .. })
        )
    }
}
