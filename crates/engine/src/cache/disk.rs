//! On-disk cache tier
//!
//! One file per key, named by the SHA-256 of the key. The index lives in
//! memory only, so the directory is emptied when the tier is opened.

use super::CacheError;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use walkdir::WalkDir;

const ENTRY_EXTENSION: &str = "cache";

#[derive(Debug, Clone)]
struct DiskEntry {
    path: PathBuf,
    size: u64,
    written_at: Instant,
}

struct DiskIndex {
    entries: LruCache<String, DiskEntry>,
    bytes: u64,
}

impl DiskIndex {
    fn remove(&mut self, key: &str) -> Option<DiskEntry> {
        let entry = self.entries.pop(key)?;
        self.bytes -= entry.size;
        Some(entry)
    }
}

pub struct DiskTier {
    dir: PathBuf,
    max_bytes: u64,
    ttl: Duration,
    index: Mutex<DiskIndex>,
}

impl DiskTier {
    /// Create the cache directory and remove entries left by a previous instance
    pub fn open(dir: &Path, max_bytes: u64, ttl: Duration) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir)?;
        let stale = purge_directory(dir)?;
        if stale > 0 {
            debug!(dir = %dir.display(), stale, "Removed stale disk cache entries");
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            max_bytes,
            ttl,
            index: Mutex::new(DiskIndex {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read `key` back from disk
    ///
    /// Expired or unreadable entries are dropped and reported as misses.
    pub async fn get(&self, key: &str, now: Instant) -> Option<Vec<u8>> {
        let lookup = {
            let mut index = self.index.lock();
            let expired = now.saturating_duration_since(index.entries.peek(key)?.written_at)
                >= self.ttl;
            if expired {
                Err(index.remove(key))
            } else {
                Ok(index.entries.get(key).map(|e| e.path.clone()))
            }
        };

        match lookup {
            Ok(Some(path)) => match tokio::fs::read(&path).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(key, path = %path.display(), error = %e, "Disk cache entry unreadable");
                    self.index.lock().remove(key);
                    None
                }
            },
            Ok(None) => None,
            Err(expired) => {
                if let Some(entry) = expired {
                    remove_file_quietly(&entry.path).await;
                }
                None
            }
        }
    }

    /// Write `value` under `key`, evicting least recently used entries past the budget
    ///
    /// Returns the number of entries evicted.
    pub async fn put(&self, key: &str, value: &[u8], now: Instant) -> Result<usize, CacheError> {
        let size = value.len() as u64;
        if size > self.max_bytes {
            debug!(key, size, budget = self.max_bytes, "Value exceeds disk budget, not cached");
            return Ok(0);
        }

        let path = self.entry_path(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let evicted = {
            let mut index = self.index.lock();
            index.remove(key);
            let mut evicted = Vec::new();
            while index.bytes + size > self.max_bytes {
                let Some((evicted_key, entry)) = index.entries.pop_lru() else {
                    break;
                };
                index.bytes -= entry.size;
                debug!(key = %evicted_key, size = entry.size, "Evicted from disk tier");
                evicted.push(entry);
            }
            index.entries.put(
                key.to_string(),
                DiskEntry {
                    path,
                    size,
                    written_at: now,
                },
            );
            index.bytes += size;
            evicted
        };

        for entry in &evicted {
            remove_file_quietly(&entry.path).await;
        }
        Ok(evicted.len())
    }

    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.index.lock().remove(key);
        match removed {
            Some(entry) => {
                remove_file_quietly(&entry.path).await;
                true
            }
            None => false,
        }
    }

    pub async fn purge_expired(&self, now: Instant) -> usize {
        let expired: Vec<DiskEntry> = {
            let mut index = self.index.lock();
            let keys: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.written_at) >= self.ttl)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| index.remove(k)).collect()
        };
        for entry in &expired {
            remove_file_quietly(&entry.path).await;
        }
        expired.len()
    }

    pub async fn clear(&self) {
        let entries: Vec<DiskEntry> = {
            let mut index = self.index.lock();
            index.bytes = 0;
            let mut drained = Vec::with_capacity(index.entries.len());
            while let Some((_, entry)) = index.entries.pop_lru() {
                drained.push(entry);
            }
            drained
        };
        for entry in &entries {
            remove_file_quietly(&entry.path).await;
        }
    }

    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn bytes(&self) -> u64 {
        self.index.lock().bytes
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.lock().entries.contains(key)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir
            .join(format!("{}.{}", hex::encode(digest), ENTRY_EXTENSION))
    }
}

/// Delete cache entry files directly inside `dir`, leaving anything else alone
fn purge_directory(dir: &Path) -> Result<usize, CacheError> {
    let mut removed = 0;
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| CacheError::Io(e.into()))?;
        let path = entry.path();
        let ours = path
            .extension()
            .map(|ext| ext == ENTRY_EXTENSION || ext == "tmp")
            .unwrap_or(false);
        if entry.file_type().is_file() && ours {
            std::fs::remove_file(path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove disk cache file");
        }
    }
}
