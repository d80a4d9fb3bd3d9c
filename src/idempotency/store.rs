use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::record::{CheckResult, IdempotencyRecord};
use super::{ExecuteOnceError, IdempotencyError};
use crate::cache::KeyValueCache;
use crate::config::IdempotencyConfig;

/// Proof of lock ownership returned by [`IdempotencyStore::lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    owner: String,
}

impl LockToken {
    /// The idempotency key this lock guards.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

/// Outcome of [`IdempotencyStore::execute_once`].
#[derive(Debug, Clone, PartialEq)]
pub enum Executed<T> {
    /// The operation ran in this call.
    Fresh(T),
    /// The operation had already completed; carries the stored response
    /// when one was recorded.
    Duplicate(Option<T>),
}

impl<T> Executed<T> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Executed::Duplicate(_))
    }

    pub fn into_result(self) -> Option<T> {
        match self {
            Executed::Fresh(value) => Some(value),
            Executed::Duplicate(value) => value,
        }
    }
}

enum Lookup<T> {
    Missing,
    Found(Option<T>),
}

/// Deduplication over a shared key-value cache.
///
/// Records live under `<prefix><key>` and locks under `lock:<prefix><key>`.
/// Clones share the underlying cache.
#[derive(Clone)]
pub struct IdempotencyStore {
    cache: Arc<dyn KeyValueCache>,
    config: IdempotencyConfig,
}

impl std::fmt::Debug for IdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("key_prefix", &self.config.key_prefix)
            .finish_non_exhaustive()
    }
}

impl IdempotencyStore {
    pub fn new(cache: Arc<dyn KeyValueCache>, config: IdempotencyConfig) -> Self {
        Self { cache, config }
    }

    /// A store sharing this cache but keeping its records under `prefix`.
    pub fn namespaced(&self, prefix: impl Into<String>) -> Self {
        let mut config = self.config.clone();
        config.key_prefix = prefix.into();
        Self {
            cache: self.cache.clone(),
            config,
        }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("lock:{}{}", self.config.key_prefix, key)
    }

    /// Whether a completed record exists for `key`. Agrees with
    /// [`check`](Self::check): a record that cannot be decoded is missing.
    pub async fn is_duplicate(&self, key: &str) -> Result<bool, IdempotencyError> {
        Ok(matches!(self.lookup::<IgnoredAny>(key).await?, Lookup::Found(_)))
    }

    /// Read a record and its stored response.
    pub async fn check<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<CheckResult<T>, IdempotencyError> {
        Ok(match self.lookup(key).await? {
            Lookup::Missing => CheckResult::not_found(),
            Lookup::Found(original_response) => CheckResult {
                is_duplicate: true,
                original_response,
            },
        })
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>, IdempotencyError> {
        let Some(bytes) = self.cache.get(&self.record_key(key)).await? else {
            return Ok(Lookup::Missing);
        };
        match IdempotencyRecord::<T>::decode(&bytes) {
            Some(record) => Ok(Lookup::Found(record.response)),
            None => {
                warn!(key, "corrupt idempotency record ignored");
                Ok(Lookup::Missing)
            }
        }
    }

    /// Record `key` as completed. `ttl` defaults to the configured 24h.
    pub async fn mark_processed<T: Serialize>(
        &self,
        key: &str,
        response: Option<&T>,
        ttl: Option<Duration>,
    ) -> Result<(), IdempotencyError> {
        let record = IdempotencyRecord::new(response);
        let bytes = record.encode(key)?;
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        self.cache.set(&self.record_key(key), bytes, Some(ttl)).await?;
        Ok(())
    }

    /// Record `key` as completed without storing a response.
    pub async fn mark_seen(&self, key: &str, ttl: Option<Duration>) -> Result<(), IdempotencyError> {
        self.mark_processed::<()>(key, None, ttl).await
    }

    /// Atomically record `key` unless a record already exists.
    ///
    /// Returns `true` if this call created the record.
    pub async fn mark_if_absent(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, IdempotencyError> {
        let bytes = IdempotencyRecord::<()>::new(None).encode(key)?;
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        Ok(self
            .cache
            .set_nx(&self.record_key(key), bytes, Some(ttl))
            .await?)
    }

    /// Remove the record for `key`.
    pub async fn forget(&self, key: &str) -> Result<bool, IdempotencyError> {
        Ok(self.cache.del(&self.record_key(key)).await?)
    }

    /// Try to take the lock for `key`; `None` when someone else holds it.
    pub async fn lock(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<LockToken>, IdempotencyError> {
        let owner = Uuid::new_v4().to_string();
        let ttl = ttl.unwrap_or_else(|| self.config.lock_ttl());
        let acquired = self
            .cache
            .set_nx(&self.lock_key(key), owner.clone().into_bytes(), Some(ttl))
            .await?;
        Ok(acquired.then(|| LockToken {
            key: key.to_string(),
            owner,
        }))
    }

    /// Release a lock only if `token` still owns it.
    ///
    /// Returns `false` when the lock expired and was taken by someone else.
    pub async fn release(&self, token: &LockToken) -> Result<bool, IdempotencyError> {
        Ok(self
            .cache
            .delete_if_eq(&self.lock_key(&token.key), token.owner.as_bytes())
            .await?)
    }

    /// Delete the lock regardless of owner.
    pub async fn unlock(&self, key: &str) -> Result<bool, IdempotencyError> {
        Ok(self.cache.del(&self.lock_key(key)).await?)
    }

    /// Run `operation` at most once per `key` across every caller sharing
    /// the cache.
    ///
    /// The lock is held for the whole operation, so the operation must
    /// finish well within the lock TTL; otherwise a second caller may take
    /// the expired lock and run it again. Failed operations are not
    /// recorded and may be retried.
    #[instrument(level = "debug", skip(self, operation, ttl), fields(prefix = %self.config.key_prefix))]
    pub async fn execute_once<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
        ttl: Option<Duration>,
    ) -> Result<Executed<T>, ExecuteOnceError<E>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        if let Lookup::Found(response) = self.lookup::<T>(key).await? {
            debug!(key, "duplicate detected before lock");
            return Ok(Executed::Duplicate(response));
        }

        let token = match self.lock(key, None).await? {
            Some(token) => token,
            None => {
                tokio::time::sleep(self.config.lock_retry_delay()).await;
                if let Lookup::Found(response) = self.lookup::<T>(key).await? {
                    debug!(key, "duplicate completed by concurrent holder");
                    return Ok(Executed::Duplicate(response));
                }
                return Err(IdempotencyError::LockContention {
                    key: key.to_string(),
                }
                .into());
            }
        };

        let outcome = self.run_locked(key, operation, ttl).await;

        if let Err(err) = self.release(&token).await {
            warn!(key, error = %err, "failed to release idempotency lock");
        }
        outcome
    }

    async fn run_locked<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
        ttl: Option<Duration>,
    ) -> Result<Executed<T>, ExecuteOnceError<E>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        // A previous holder may have finished between the check and the lock.
        if let Lookup::Found(response) = self.lookup::<T>(key).await? {
            return Ok(Executed::Duplicate(response));
        }

        let value = operation().await.map_err(ExecuteOnceError::Operation)?;
        self.mark_processed(key, Some(&value), ttl).await?;
        Ok(Executed::Fresh(value))
    }
}
