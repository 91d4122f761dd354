//! Per-address decision cache with TTL-based expiration and sharding.
//!
//! Keys are the string form of the normalised client address; values are
//! the boolean outcome of the blocklist lookup. The cache is sharded so
//! that distinct address strings rarely contend on the same lock. Entries
//! expire after a TTL and are refreshed slightly early (within a jittered
//! window before expiry) so a busy address does not stampede the table the
//! instant its entry lapses.
//!
//! Rule-set changes never clear this cache in place: the owner replaces
//! the whole cache together with the match table.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_SHARDS: usize = 10;
const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
const EARLY_REFRESH_MIN_MS: u64 = 100;
const EARLY_REFRESH_MAX_MS: u64 = 300;
// Fraction of a full shard evicted once expired entries are gone.
const EVICTION_PERCENT: usize = 10;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    decision: bool,
    cached_at: Instant,
}

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<String, CacheEntry>,
}

/// Statistics about the decision cache.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Sharded TTL cache from normalised address string to allow/deny outcome.
#[derive(Debug)]
pub struct DecisionCache {
    shards: Vec<Mutex<Shard>>,
    shard_capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DecisionCache {
    pub fn new(capacity: usize, shards: usize, ttl: Duration) -> Self {
        let shards = shards.max(1);
        DecisionCache {
            shards: (0..shards).map(|_| Mutex::new(Shard::default())).collect(),
            shard_capacity: (capacity / shards).max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Look up a cached decision.
    ///
    /// Returns `None` for absent or expired entries, and also for entries
    /// inside the early-refresh window before expiry so the caller
    /// recomputes and reinserts them ahead of time.
    pub fn get(&self, key: &str) -> Option<bool> {
        let mut shard = self.shard(key).lock().expect("cache shard lock poisoned");
        let hit = match shard.entries.get(key) {
            Some(entry) => {
                let age = entry.cached_at.elapsed();
                if age >= self.ttl {
                    shard.entries.remove(key);
                    None
                } else if self.ttl - age <= early_refresh_window() {
                    // Close to expiry: treat as a miss so the caller
                    // refreshes the entry before it lapses.
                    None
                } else {
                    Some(entry.decision)
                }
            }
            None => None,
        };
        match hit {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    /// Insert or refresh a decision.
    pub fn insert(&self, key: &str, decision: bool) {
        let mut shard = self.shard(key).lock().expect("cache shard lock poisoned");
        if shard.entries.len() >= self.shard_capacity && !shard.entries.contains_key(key) {
            self.evict(&mut shard);
        }
        shard.entries.insert(
            key.to_string(),
            CacheEntry {
                decision,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries; if the shard is still full, drop the oldest
    /// EVICTION_PERCENT of it.
    fn evict(&self, shard: &mut Shard) {
        let ttl = self.ttl;
        shard.entries.retain(|_, e| e.cached_at.elapsed() < ttl);
        if shard.entries.len() < self.shard_capacity {
            return;
        }
        let to_drop = (self.shard_capacity * EVICTION_PERCENT / 100).max(1);
        let mut by_age: Vec<(String, Instant)> = shard
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.cached_at))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        for (key, _) in by_age.into_iter().take(to_drop) {
            shard.entries.remove(&key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self
                .shards
                .iter()
                .map(|s| s.lock().expect("cache shard lock poisoned").entries.len())
                .sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_SHARDS, DEFAULT_TTL)
    }
}

fn early_refresh_window() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(EARLY_REFRESH_MIN_MS..=EARLY_REFRESH_MAX_MS))
}
