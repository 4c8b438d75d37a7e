//! Time-boxed lookup cache
//!
//! Used by adapters for lookups that are expensive but change rarely (cover
//! art by album). Concurrent fetches of the same key are not coalesced; the
//! last write wins. Failed fetches are not cached. Every store drops the
//! entries that have expired, so keys seen once do not pile up.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Map whose entries expire `ttl` after being stored
pub struct ExpiringCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Unexpired value for `key`
    pub async fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now()).await
    }

    /// Value for `key` as seen at `now`
    pub async fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| now.saturating_duration_since(entry.stored_at) < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Store `value`, replacing any previous entry and dropping expired ones
    pub async fn insert(&self, key: K, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        self.retain_fresh(&mut entries, now);
        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
            },
        );
    }

    /// Cached value for `key`, or the result of `fetch` (stored on success)
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        // The lock is not held across the fetch.
        let value = fetch().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }

    /// Drop every expired entry
    pub async fn purge_expired(&self) {
        let mut entries = self.entries.write().await;
        self.retain_fresh(&mut entries, Instant::now());
    }

    fn retain_fresh(&self, entries: &mut HashMap<K, CacheEntry<V>>, now: Instant) {
        entries.retain(|_, entry| now.saturating_duration_since(entry.stored_at) < self.ttl);
    }

    /// Number of stored entries, expired or not
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
