//! # Caching Layer - bounded, time-expiring in-memory cache
//!
//! Used for token counts and known completions. Last write wins; when full,
//! expired entries go first, then the oldest insertion.

use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Unique cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn tokens(text: &str) -> Self {
        Self(format!("tokens:{}", text))
    }

    pub fn completion(prefix: &str) -> Self {
        Self(format!("completion:{}", prefix))
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl: Duration::minutes(30),
        }
    }
}

struct Entry {
    data: Vec<u8>,
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// In-memory TTL cache storing bincode-encoded values
pub struct TtlCache {
    entries: RwLock<HashMap<CacheKey, Entry>>,
    config: CacheConfig,
    stats: RwLock<CacheStats>,
}

impl TtlCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub async fn get<T: for<'de> Deserialize<'de>>(&self, key: &CacheKey) -> Option<T> {
        let now = Utc::now();
        let mut expired = false;
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                if entry.expires_at > now {
                    if let Ok(value) = bincode::deserialize(&entry.data) {
                        let mut stats = self.stats.write().await;
                        stats.total_requests += 1;
                        stats.hits += 1;
                        return Some(value);
                    }
                } else {
                    expired = true;
                }
            }
        }

        if expired {
            self.entries.write().await.remove(key);
        }
        let mut stats = self.stats.write().await;
        stats.total_requests += 1;
        stats.misses += 1;
        if expired {
            stats.expirations += 1;
        }
        None
    }

    pub async fn put<T: Serialize>(&self, key: CacheKey, value: &T) -> Result<()> {
        self.put_with_ttl(key, value, self.config.default_ttl).await
    }

    pub async fn put_with_ttl<T: Serialize>(&self, key: CacheKey, value: &T, ttl: Duration) -> Result<()> {
        let data = bincode::serialize(value)?;
        let now = Utc::now();

        let mut entries = self.entries.write().await;

        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            let before = entries.len();
            entries.retain(|_, e| e.expires_at > now);
            let expired = (before - entries.len()) as u64;

            let mut evicted = 0;
            if entries.len() >= self.config.max_entries {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                    evicted = 1;
                }
            }

            let mut stats = self.stats.write().await;
            stats.expirations += expired;
            stats.evictions += evicted;
        }

        entries.insert(
            key,
            Entry {
                data,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }
}

/// Configuration builder
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_entries(mut self, count: usize) -> Self {
        self.config.max_entries = count;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}
