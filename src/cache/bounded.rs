//! Generic bounded cache
//!
//! A keyed store with a hard size bound, optional TTL expiry, and a
//! configurable eviction strategy. Eviction is an O(n) scan over the
//! current entries, which is fine given the bounded `max_size`; ties
//! are broken by insertion order (first inserted wins).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Which entry to evict when the cache is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionStrategy {
    /// Evict the entry with the smallest last-access sequence number.
    Lru,
    /// Evict the entry with the smallest access count.
    Lfu,
    /// Evict the entry with the oldest insertion timestamp.
    Fifo,
}

/// Cache sizing and expiry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Hard bound on entry count. Never exceeded; eviction happens
    /// before an insertion that would overflow it.
    pub max_size: usize,
    /// Entries older than this are treated as absent on `get`.
    pub max_age: Option<Duration>,
    pub strategy: EvictionStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_age: None,
            strategy: EvictionStrategy::Lru,
        }
    }
}

/// Counters reported by [`BoundedCache::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    access_count: u64,
    /// Monotonic counter, not wall-clock, so LRU comparisons are
    /// stable within a tick.
    last_access_seq: u64,
}

/// Bounded keyed cache with pluggable eviction.
pub struct BoundedCache<K, V> {
    config: CacheConfig,
    entries: HashMap<K, Entry<V>>,
    /// Insertion order, for FIFO scans and deterministic tie-breaking.
    order: Vec<K>,
    seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    pub fn new(mut config: CacheConfig) -> Self {
        if config.max_size == 0 {
            config.max_size = 1;
        }
        Self {
            config,
            entries: HashMap::new(),
            order: Vec::new(),
            seq: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Look up a key. Expired entries are removed and counted as
    /// misses; hits refresh the access count and LRU sequence number.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let expired = match self.entries.get(key) {
            Some(entry) => self.is_expired(entry),
            None => {
                self.misses += 1;
                return None;
            }
        };

        if expired {
            self.remove_key(key);
            self.misses += 1;
            return None;
        }

        self.seq += 1;
        self.hits += 1;
        let seq = self.seq;
        let entry = self.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access_seq = seq;
        Some(&entry.value)
    }

    /// Insert or replace a value. When the key is new and the cache is
    /// at capacity, one entry is evicted first per the strategy.
    pub fn set(&mut self, key: K, value: V) {
        if !self.entries.contains_key(&key) {
            if self.entries.len() >= self.config.max_size {
                self.evict_one();
            }
            self.order.push(key.clone());
        }
        self.seq += 1;
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                access_count: 0,
                last_access_seq: self.seq,
            },
        );
    }

    /// True if a live (non-expired) entry exists. Does not touch
    /// access metadata or hit/miss counters.
    pub fn has(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .map(|entry| !self.is_expired(entry))
            .unwrap_or(false)
    }

    pub fn delete(&mut self, key: &K) -> bool {
        if self.entries.contains_key(key) {
            self.remove_key(key);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn clean_expired(&mut self) -> usize {
        let expired: Vec<K> = self
            .order
            .iter()
            .filter(|key| {
                self.entries
                    .get(key)
                    .map(|entry| self.is_expired(entry))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        for key in &expired {
            self.remove_key(key);
        }
        expired.len()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        CacheStats {
            size: self.entries.len(),
            max_size: self.config.max_size,
            hits: self.hits,
            misses: self.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
            evictions: self.evictions,
        }
    }

    fn is_expired(&self, entry: &Entry<V>) -> bool {
        match self.config.max_age {
            Some(max_age) => entry.inserted_at.elapsed() > max_age,
            None => false,
        }
    }

    fn remove_key(&mut self, key: &K) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }

    fn evict_one(&mut self) {
        let victim = match self.config.strategy {
            EvictionStrategy::Lru => self
                .order
                .iter()
                .min_by_key(|k| self.entries[*k].last_access_seq),
            EvictionStrategy::Lfu => self
                .order
                .iter()
                .min_by_key(|k| self.entries[*k].access_count),
            EvictionStrategy::Fifo => self
                .order
                .iter()
                .min_by_key(|k| self.entries[*k].inserted_at),
        }
        .cloned();

        if let Some(key) = victim {
            self.remove_key(&key);
            self.evictions += 1;
            tracing::debug!(strategy = ?self.config.strategy, "cache full, evicted one entry");
        }
    }
}
