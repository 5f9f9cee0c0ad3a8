//! Hybrid memory + disk cache for previews and thumbnails
//!
//! The memory tier is checked first; on a memory miss the disk tier (when
//! the strategy includes it) is consulted and a hit is promoted back into
//! memory. Writes go to memory and are mirrored to disk. Both tiers evict
//! least-recently-used entries past their byte budget and treat entries
//! older than the TTL as absent.

mod disk;
mod memory;

pub use disk::DiskTier;
pub use memory::{CacheEntry, MemoryTier, PutOutcome};

use crate::config::{CacheConfig, CacheStrategy};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Error type for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hit/miss counters and tier occupancy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CacheStats {
    pub strategy: CacheStrategy,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expired: u64,
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub disk_entries: usize,
    pub disk_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

/// Two-tier cache scoped to one engine instance
pub struct HybridCache {
    strategy: CacheStrategy,
    memory: Option<Mutex<MemoryTier>>,
    disk: Option<DiskTier>,
    counters: Counters,
}

impl HybridCache {
    /// Build the tiers the configured strategy asks for
    ///
    /// Opening the disk tier empties its directory.
    pub fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        Self::open_with_ttl(config, config.ttl())
    }

    /// Like [`HybridCache::open`] with a TTL finer than whole seconds
    pub fn open_with_ttl(config: &CacheConfig, ttl: Duration) -> Result<Self, CacheError> {
        let memory = config
            .strategy
            .uses_memory()
            .then(|| Mutex::new(MemoryTier::new(config.max_memory_bytes, ttl)));
        let disk = if config.strategy.uses_disk() {
            Some(DiskTier::open(&config.directory, config.max_disk_bytes, ttl)?)
        } else {
            None
        };
        debug!(strategy = ?config.strategy, "Cache opened");
        Ok(Self {
            strategy: config.strategy,
            memory,
            disk,
            counters: Counters::default(),
        })
    }

    /// A cache that stores nothing
    pub fn disabled() -> Self {
        Self {
            strategy: CacheStrategy::None,
            memory: None,
            disk: None,
            counters: Counters::default(),
        }
    }

    pub fn strategy(&self) -> CacheStrategy {
        self.strategy
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();

        if let Some(memory) = &self.memory {
            if let Some(value) = memory.lock().get(key, now) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }

        if let Some(disk) = &self.disk {
            if let Some(value) = disk.get(key, now).await {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(memory) = &self.memory {
                    let outcome = memory.lock().put(key, value.clone(), now);
                    self.record_put(&outcome);
                    debug!(key, "Promoted disk cache hit into memory");
                }
                return Some(value);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `value`; disk-tier failures are logged and otherwise ignored
    pub async fn put(&self, key: &str, value: Vec<u8>) {
        let now = Instant::now();

        if let Some(disk) = &self.disk {
            match disk.put(key, &value, now).await {
                Ok(evicted) => {
                    self.counters
                        .evictions
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                }
                Err(e) => warn!(key, error = %e, "Disk cache write failed"),
            }
        }

        if let Some(memory) = &self.memory {
            let outcome = memory.lock().put(key, value, now);
            self.record_put(&outcome);
        }
    }

    pub async fn remove(&self, key: &str) -> bool {
        let in_memory = self
            .memory
            .as_ref()
            .map(|m| m.lock().remove(key))
            .unwrap_or(false);
        let on_disk = match &self.disk {
            Some(disk) => disk.remove(key).await,
            None => false,
        };
        in_memory || on_disk
    }

    /// Drop TTL-expired entries from both tiers
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = self
            .memory
            .as_ref()
            .map(|m| m.lock().purge_expired(now))
            .unwrap_or(0);
        if let Some(disk) = &self.disk {
            purged += disk.purge_expired(now).await;
        }
        self.counters
            .expired
            .fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    pub async fn clear(&self) {
        if let Some(memory) = &self.memory {
            memory.lock().clear();
        }
        if let Some(disk) = &self.disk {
            disk.clear().await;
        }
    }

    /// Keys resident in the memory tier, most recently used first
    pub fn memory_keys(&self) -> Vec<String> {
        self.memory
            .as_ref()
            .map(|m| m.lock().keys())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let (memory_entries, memory_bytes) = self
            .memory
            .as_ref()
            .map(|m| {
                let tier = m.lock();
                (tier.len(), tier.bytes())
            })
            .unwrap_or((0, 0));
        let (disk_entries, disk_bytes) = self
            .disk
            .as_ref()
            .map(|d| (d.len(), d.bytes()))
            .unwrap_or((0, 0));

        CacheStats {
            strategy: self.strategy,
            hits,
            misses,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            memory_entries,
            memory_bytes,
            disk_entries,
            disk_bytes,
        }
    }

    fn record_put(&self, outcome: &PutOutcome) {
        self.counters
            .evictions
            .fetch_add(outcome.evicted.len() as u64, Ordering::Relaxed);
        self.counters
            .expired
            .fetch_add(outcome.expired as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const MB: u64 = 1024 * 1024;

    fn config(strategy: CacheStrategy, dir: &Path, max_memory: u64) -> CacheConfig {
        CacheConfig {
            strategy,
            max_memory_bytes: max_memory,
            max_disk_bytes: 64 * MB,
            ttl_secs: 3600,
            directory: dir.to_path_buf(),
            sweep_interval_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_scenario_three_mb_budget_keeps_last_three() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HybridCache::open(&config(CacheStrategy::Memory, dir.path(), 3 * MB)).unwrap();

        for key in ["A", "B", "C", "D", "E"] {
            cache.put(key, vec![0u8; MB as usize]).await;
        }

        let mut resident = cache.memory_keys();
        resident.sort();
        assert_eq!(resident, vec!["C", "D", "E"]);
        let stats = cache.stats();
        assert_eq!(stats.evictions, 2);
        assert_eq!(stats.memory_bytes, 3 * MB);
    }

    #[tokio::test]
    async fn test_disk_hit_is_promoted_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HybridCache::open(&config(CacheStrategy::Hybrid, dir.path(), 10)).unwrap();

        cache.put("first", vec![1; 8]).await;
        // Pushes "first" out of the 10-byte memory tier but not off disk
        cache.put("second", vec![2; 8]).await;
        assert_eq!(cache.memory_keys(), vec!["second"]);

        assert_eq!(cache.get("first").await, Some(vec![1; 8]));
        assert_eq!(cache.memory_keys(), vec!["first"]);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.disk_entries, 2);
    }

    #[tokio::test]
    async fn test_ttl_expires_regardless_of_room() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HybridCache::open_with_ttl(
            &config(CacheStrategy::Hybrid, dir.path(), MB),
            Duration::from_millis(50),
        )
        .unwrap();

        cache.put("thumb", vec![7; 16]).await;
        assert!(cache.get("thumb").await.is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(cache.get("thumb").await.is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_purge_expired_sweeps_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HybridCache::open_with_ttl(
            &config(CacheStrategy::Hybrid, dir.path(), MB),
            Duration::from_millis(20),
        )
        .unwrap();

        cache.put("a", vec![1; 4]).await;
        cache.put("b", vec![2; 4]).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.purge_expired().await, 4);
        let stats = cache.stats();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.disk_entries, 0);
        assert_eq!(stats.expired, 4);
    }

    #[tokio::test]
    async fn test_none_strategy_never_stores() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HybridCache::open(&config(CacheStrategy::None, dir.path(), MB)).unwrap();

        cache.put("k", vec![1, 2, 3]).await;

        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.stats().misses, 1);
        assert!(cache.memory_keys().is_empty());
        assert!(HybridCache::disabled().get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_disk_only_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HybridCache::open(&config(CacheStrategy::Disk, dir.path(), MB)).unwrap();

        cache.put("k", vec![9; 32]).await;

        assert_eq!(cache.get("k").await, Some(vec![9; 32]));
        assert!(cache.memory_keys().is_empty());
        assert_eq!(cache.stats().disk_bytes, 32);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HybridCache::open(&config(CacheStrategy::Hybrid, dir.path(), MB)).unwrap();

        cache.put("a", vec![1]).await;
        cache.put("b", vec![2]).await;
        assert!(cache.remove("a").await);
        assert!(!cache.remove("a").await);
        assert!(cache.get("a").await.is_none());

        cache.clear().await;
        let stats = cache.stats();
        assert_eq!(stats.memory_entries + stats.disk_entries, 0);
        assert!((stats.hit_rate - 0.0).abs() < f64::EPSILON);
    }
}
