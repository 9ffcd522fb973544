use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::CacheConfig;

/// Cached value with its insertion time
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// LRU-bounded TTL cache for per-farmer message analysis.
///
/// Keys are derived from (farmer id, normalized message, conversation type), so
/// the same question asked with different spacing or casing hits the same entry.
pub struct ResponseCache<V> {
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

impl<V: Clone> ResponseCache<V> {
    /// * `capacity` - Maximum number of entries (at least 1)
    /// * `ttl` - Time-to-live for entries
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.ttl())
    }

    /// Cache key for a message.
    pub fn key(farmer_id: i64, message: &str, conversation_type: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(farmer_id.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(normalize_message(message).as_bytes());
        hasher.update(b"|");
        hasher.update(conversation_type.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up a live entry; expired entries are removed and count as misses.
    pub async fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let lookup = entries
            .get(key)
            .map(|entry| (entry.inserted_at.elapsed() < self.ttl, entry.value.clone()));

        let live = match lookup {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                entries.pop(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };

        match live {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn insert(&self, key: String, value: V) {
        let mut entries = self.entries.lock().await;
        let evicted = entries.push(
            key.clone(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
        if matches!(evicted, Some((ref old_key, _)) if *old_key != key) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Serve from cache when a live entry exists, otherwise run `compute` and store
    /// its result. Errors are returned and never cached.
    pub async fn get_or_compute<E, F, Fut>(
        &self,
        farmer_id: i64,
        message: &str,
        conversation_type: &str,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let key = Self::key(farmer_id, message, conversation_type);
        if let Some(value) = self.get(&key).await {
            debug!(farmer_id, conversation_type, "Response cache hit");
            return Ok(value);
        }

        let value = compute().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }

    /// Remove expired entries.
    pub async fn prune_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }
        self.evictions
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.lock().await.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

/// Lowercase, trim and collapse internal whitespace.
pub fn normalize_message(message: &str) -> String {
    message
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
