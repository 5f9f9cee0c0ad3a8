//! In-memory cache tier with byte-budgeted LRU eviction and TTL

use lru::LruCache;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A cached value and its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub size: u64,
    pub written_at: Instant,
    pub last_access: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.written_at) >= ttl
    }
}

/// What a put did to the tier
#[derive(Debug, Default, PartialEq)]
pub struct PutOutcome {
    pub stored: bool,
    pub evicted: Vec<String>,
    pub expired: usize,
}

/// Memory tier
///
/// `bytes` never exceeds `max_bytes`: a value larger than the whole budget
/// is refused instead of stored.
pub struct MemoryTier {
    entries: LruCache<String, CacheEntry>,
    bytes: u64,
    max_bytes: u64,
    ttl: Duration,
}

impl MemoryTier {
    pub fn new(max_bytes: u64, ttl: Duration) -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
            max_bytes,
            ttl,
        }
    }

    /// Look up `key`, marking it most recently used
    ///
    /// An expired entry is dropped and reported as a miss.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<Vec<u8>> {
        let expired = self.entries.peek(key)?.is_expired(now, self.ttl);
        if expired {
            self.remove(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.last_access = now;
        Some(entry.value.clone())
    }

    pub fn put(&mut self, key: &str, value: Vec<u8>, now: Instant) -> PutOutcome {
        let mut outcome = PutOutcome::default();
        self.remove(key);

        let size = value.len() as u64;
        if size > self.max_bytes {
            debug!(key, size, budget = self.max_bytes, "Value exceeds memory budget, not cached");
            return outcome;
        }

        if self.bytes + size > self.max_bytes {
            outcome.expired = self.purge_expired(now);
        }
        while self.bytes + size > self.max_bytes {
            let Some((evicted_key, evicted)) = self.entries.pop_lru() else {
                break;
            };
            self.bytes -= evicted.size;
            debug!(key = %evicted_key, size = evicted.size, "Evicted from memory tier");
            outcome.evicted.push(evicted_key);
        }

        self.entries.put(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                size,
                written_at: now,
                last_access: now,
            },
        );
        self.bytes += size;
        outcome.stored = true;
        outcome
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(entry) => {
                self.bytes -= entry.size;
                true
            }
            None => false,
        }
    }

    /// Drop every entry older than the TTL, returning how many went
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now, self.ttl))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    /// Presence check that does not touch recency
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    /// Resident keys, most recently used first
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u64 = 1024 * 1024;
    const HOUR: Duration = Duration::from_secs(3600);

    fn value(len: u64) -> Vec<u8> {
        vec![0xAB; len as usize]
    }

    #[test]
    fn test_lru_eviction_keeps_most_recent() {
        let mut tier = MemoryTier::new(3 * MB, HOUR);
        let now = Instant::now();

        for key in ["A", "B", "C", "D", "E"] {
            tier.put(key, value(MB), now);
        }

        let mut keys = tier.keys();
        keys.sort();
        assert_eq!(keys, vec!["C", "D", "E"]);
        assert_eq!(tier.bytes(), 3 * MB);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let mut tier = MemoryTier::new(3 * MB, HOUR);
        let now = Instant::now();

        tier.put("A", value(MB), now);
        tier.put("B", value(MB), now);
        tier.put("C", value(MB), now);
        assert!(tier.get("A", now).is_some());

        let outcome = tier.put("D", value(MB), now);

        assert_eq!(outcome.evicted, vec!["B".to_string()]);
        assert!(tier.contains("A"));
        assert!(!tier.contains("B"));
    }

    #[test]
    fn test_expired_entry_is_a_miss_even_with_room() {
        let mut tier = MemoryTier::new(10 * MB, Duration::from_secs(60));
        let start = Instant::now();

        tier.put("thumb", value(10), start);
        assert!(tier.get("thumb", start + Duration::from_secs(59)).is_some());
        assert!(tier.get("thumb", start + Duration::from_secs(60)).is_none());
        assert!(!tier.contains("thumb"));
        assert_eq!(tier.bytes(), 0);
    }

    #[test]
    fn test_oversized_value_is_refused() {
        let mut tier = MemoryTier::new(MB, HOUR);
        let now = Instant::now();

        tier.put("small", value(10), now);
        let outcome = tier.put("huge", value(2 * MB), now);

        assert!(!outcome.stored);
        assert!(outcome.evicted.is_empty());
        assert!(tier.contains("small"));
        assert!(!tier.contains("huge"));
    }

    #[test]
    fn test_overwrite_adjusts_bytes() {
        let mut tier = MemoryTier::new(MB, HOUR);
        let now = Instant::now();

        tier.put("k", value(100), now);
        tier.put("k", value(40), now);

        assert_eq!(tier.len(), 1);
        assert_eq!(tier.bytes(), 40);
        assert_eq!(tier.get("k", now).map(|v| v.len()), Some(40));
    }

    #[test]
    fn test_purge_expired_prefers_stale_entries() {
        let mut tier = MemoryTier::new(3 * MB, Duration::from_secs(10));
        let start = Instant::now();

        tier.put("old", value(MB), start);
        tier.put("fresh1", value(MB), start + Duration::from_secs(8));
        tier.put("fresh2", value(MB), start + Duration::from_secs(8));
        // "old" is both expired and least recent; it goes first, nothing else does
        let outcome = tier.put("new", value(MB), start + Duration::from_secs(11));

        assert_eq!(outcome.expired, 1);
        assert!(outcome.evicted.is_empty());
        assert_eq!(tier.len(), 3);
        assert!(!tier.contains("old"));
    }

    // After any sequence of puts, resident bytes stay within budget and
    // equal the sum of resident entry sizes.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_memory_budget_invariant(
            budget in 1u64..4096,
            ops in proptest::collection::vec((0usize..16, 0u64..2048), 1..64),
        ) {
            let mut tier = MemoryTier::new(budget, HOUR);
            let now = Instant::now();

            for (key_idx, len) in ops {
                tier.put(&format!("key-{}", key_idx), value(len), now);
                prop_assert!(
                    tier.bytes() <= budget,
                    "{} bytes resident with budget {}",
                    tier.bytes(), budget
                );
            }

            let resident: u64 = tier
                .keys()
                .iter()
                .map(|k| tier.entries.peek(k.as_str()).map(|e| e.size).unwrap_or(0))
                .sum();
            prop_assert_eq!(resident, tier.bytes());
        }

        #[test]
        fn prop_put_then_get_round_trip(
            key in "[a-z0-9_:/.]{1,32}",
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let mut tier = MemoryTier::new(4096, HOUR);
            let now = Instant::now();

            tier.put(&key, payload.clone(), now);
            prop_assert_eq!(tier.get(&key, now), Some(payload));
        }
    }
}
