use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CacheError, KeyValueCache};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process cache backed by `Mutex<HashMap>`.
///
/// Expiry is checked lazily on access against the tokio clock, so paused-time
/// tests can advance past a TTL deterministically. Clones share storage.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, CacheError> {
        self.entries
            .lock()
            .map_err(|e| CacheError::Poisoned(e.to_string()))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.len())
    }
}

#[async_trait]
impl KeyValueCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        let expired = match entries.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.entries()?
            .insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries()?
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn set_nx(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(true)
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        let matches = entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && entry.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_and_delete() {
        let cache = InMemoryCache::new();
        cache.set("a", b"1".to_vec(), None).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(cache.exists("a").await.unwrap());
        assert!(cache.del("a").await.unwrap());
        assert!(!cache.del("a").await.unwrap());
        assert_eq!(cache.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryCache::new();
        cache
            .set("a", b"1".to_vec(), Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.exists("a").await.unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!cache.exists("a").await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_only_writes_absent_or_expired_keys() {
        let cache = InMemoryCache::new();
        let ttl = Some(Duration::from_secs(5));

        assert!(cache.set_nx("lock", b"a".to_vec(), ttl).await.unwrap());
        assert!(!cache.set_nx("lock", b"b".to_vec(), ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.set_nx("lock", b"b".to_vec(), ttl).await.unwrap());
        assert_eq!(cache.get("lock").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn delete_if_eq_checks_owner() {
        let cache = InMemoryCache::new();
        cache.set("lock", b"owner-1".to_vec(), None).await.unwrap();

        assert!(!cache.delete_if_eq("lock", b"owner-2").await.unwrap());
        assert!(cache.exists("lock").await.unwrap());
        assert!(cache.delete_if_eq("lock", b"owner-1").await.unwrap());
        assert!(!cache.exists("lock").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_reports_removed_entries() {
        let cache = InMemoryCache::new();
        cache
            .set("short", b"1".to_vec(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        cache.set("long", b"2".to_vec(), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.len(), 1);
    }
}
