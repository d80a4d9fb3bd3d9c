use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::CacheError;

/// Byte-valued cache with optional per-key TTL.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), CacheError>;

    /// Returns whether a live key was removed.
    async fn del(&self, key: &str) -> Result<bool, CacheError>;

    /// Set only if no live value exists. Returns whether the write happened.
    async fn set_nx(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Delete `key` only while it still holds `expected`.
    ///
    /// The default is a read followed by a delete and is not atomic.
    /// Backends with compare-and-delete (a script, a CAS command) override it.
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        match self.get(key).await? {
            Some(current) if current == expected => self.del(key).await,
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl<C: KeyValueCache + ?Sized> KeyValueCache for Arc<C> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        (**self).get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        (**self).set(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> Result<bool, CacheError> {
        (**self).del(key).await
    }

    async fn set_nx(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        (**self).set_nx(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        (**self).exists(key).await
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        (**self).delete_if_eq(key, expected).await
    }
}
