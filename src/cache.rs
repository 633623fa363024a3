use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Response cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before eviction kicks in
    pub capacity: usize,
    /// TTL applied when the caller does not supply one
    #[serde(with = "crate::config::duration_ms")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Duration::from_secs(3600),
        }
    }
}

/// A cached last-known-good response.
///
/// Invariant: `expires_at` is strictly after the creation instant.
#[derive(Debug, Clone)]
struct CacheEntry {
    data: Value,
    created_at: DateTime<Utc>,
    inserted: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(data: Value, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            data,
            created_at: Utc::now(),
            inserted: now,
            expires_at: now + ttl.max(Duration::from_millis(1)),
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Cache counters for stats reporting
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate as a percentage
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    expirations: u64,
    evictions: u64,
}

/// TTL key/value store of last-known-good responses with capacity-bounded
/// eviction.
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    counters: RwLock<Counters>,
    config: CacheConfig,
}

impl ResponseCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            counters: RwLock::new(Counters::default()),
            config,
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Store a response. When the store is at capacity a cleanup pass runs
    /// first: expired entries go, then the oldest fifth by creation time.
    pub async fn insert(&self, key: &str, data: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);

        {
            let entries = self.entries.read().await;
            if entries.len() >= self.config.capacity && !entries.contains_key(key) {
                drop(entries);
                self.cleanup().await;
            }
        }

        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), CacheEntry::new(data, ttl));
        debug!("Cached response under key {} (ttl {:?})", key, ttl);
    }

    /// Fetch a response. Expired entries are removed on read. Hits come back
    /// as a copy annotated `"fromCache": true` with the original creation
    /// timestamp; the stored entry is never mutated.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.write().await;

        let Some(entry) = entries.get(key) else {
            drop(entries);
            self.counters.write().await.misses += 1;
            return None;
        };

        if entry.is_expired() {
            entries.remove(key);
            drop(entries);
            let mut counters = self.counters.write().await;
            counters.expirations += 1;
            counters.misses += 1;
            debug!("Cache entry expired and removed: {}", key);
            return None;
        }

        let mut data = entry.data.clone();
        if let Some(object) = data.as_object_mut() {
            object.insert("fromCache".to_string(), Value::Bool(true));
            object.insert(
                "cachedAt".to_string(),
                Value::String(entry.created_at.to_rfc3339()),
            );
        }
        drop(entries);

        self.counters.write().await.hits += 1;
        debug!("Cache hit for key {}", key);
        Some(data)
    }

    /// Drop expired entries; if the store is still at or over capacity,
    /// evict the oldest 20% by creation time.
    async fn cleanup(&self) {
        let mut entries = self.entries.write().await;
        let mut counters = self.counters.write().await;

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
            counters.expirations += 1;
        }

        if entries.len() >= self.config.capacity {
            let mut by_age: Vec<(String, Instant)> = entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.inserted))
                .collect();
            by_age.sort_by_key(|(_, inserted)| *inserted);

            let to_evict = (self.config.capacity / 5).max(1);
            for (key, _) in by_age.into_iter().take(to_evict) {
                entries.remove(&key);
                counters.evictions += 1;
            }
            info!(
                "Cache over capacity: evicted {} oldest entries ({} expired dropped)",
                to_evict,
                expired.len()
            );
        } else if !expired.is_empty() {
            debug!("Cache cleanup removed {} expired entries", expired.len());
        }
    }

    /// Number of live (non-expired) entries
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|entry| !entry.is_expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let size = self.len().await;
        let counters = self.counters.read().await;
        CacheStats {
            size,
            capacity: self.config.capacity,
            hits: counters.hits,
            misses: counters.misses,
            expirations: counters.expirations,
            evictions: counters.evictions,
        }
    }
}
