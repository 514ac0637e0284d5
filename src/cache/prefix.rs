//! Prompt prefix cache
//!
//! Caches the tokenized form of prompts so repeated or related prompts
//! skip re-tokenization. Keyed by a 64-bit hash of the prompt; each
//! entry keeps the original prompt so hash collisions are verified
//! instead of silently returning the wrong tokens. Bounded with FIFO
//! eviction of the oldest-inserted entry.
//!
//! The engine's long-lived [`Sequence`](crate::runtime::Sequence)
//! handle is a separate mechanism: it carries the runtime's KV state
//! across calls and is not part of this keyed cache.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Instant;

use serde::Serialize;

use crate::runtime::TokenId;

/// Default bound on cached prefixes.
pub const DEFAULT_MAX_PREFIX_ENTRIES: usize = 100;

/// Size counters reported by [`PrefixCache::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefixCacheStats {
    pub size: usize,
    pub max_size: usize,
}

struct PrefixEntry {
    /// Original prompt, kept for collision verification.
    prompt: String,
    tokens: Vec<TokenId>,
    inserted_at: Instant,
}

/// Bounded FIFO cache of tokenized prompt prefixes.
pub struct PrefixCache {
    entries: HashMap<u64, PrefixEntry>,
    /// Keys in insertion order; front is evicted first.
    order: VecDeque<u64>,
    max_size: usize,
}

impl Default for PrefixCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PREFIX_ENTRIES)
    }
}

impl PrefixCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_size: max_size.max(1),
        }
    }

    fn key_for(prompt: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        prompt.hash(&mut hasher);
        hasher.finish()
    }

    /// Store the token form of a prompt, evicting the oldest-inserted
    /// entry if the cache is full.
    pub fn cache_prefix(&mut self, prompt: &str, tokens: Vec<TokenId>) {
        let key = Self::key_for(prompt);

        if !self.entries.contains_key(&key) {
            if self.entries.len() >= self.max_size {
                if let Some(oldest) = self.order.pop_front() {
                    if let Some(entry) = self.entries.remove(&oldest) {
                        tracing::debug!(
                            age_ms = entry.inserted_at.elapsed().as_millis() as u64,
                            "prefix cache full, evicted oldest entry"
                        );
                    }
                }
            }
            self.order.push_back(key);
        }

        self.entries.insert(
            key,
            PrefixEntry {
                prompt: prompt.to_string(),
                tokens,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Look up the cached token form of a prompt.
    pub fn get(&self, prompt: &str) -> Option<&[TokenId]> {
        let key = Self::key_for(prompt);
        self.entries
            .get(&key)
            .filter(|entry| entry.prompt == prompt)
            .map(|entry| entry.tokens.as_slice())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn stats(&self) -> PrefixCacheStats {
        PrefixCacheStats {
            size: self.entries.len(),
            max_size: self.max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_and_get() {
        let mut cache = PrefixCache::new(10);
        cache.cache_prefix("fn main() {", vec![1, 2, 3]);

        assert_eq!(cache.get("fn main() {"), Some(&[1, 2, 3][..]));
        assert_eq!(cache.get("fn other() {"), None);
    }

    #[test]
    fn test_fifo_eviction_of_oldest() {
        let mut cache = PrefixCache::new(2);
        cache.cache_prefix("one", vec![1]);
        cache.cache_prefix("two", vec![2]);
        cache.cache_prefix("three", vec![3]);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("one"), None);
        assert_eq!(cache.get("two"), Some(&[2][..]));
        assert_eq!(cache.get("three"), Some(&[3][..]));
    }

    #[test]
    fn test_overflow_many_entries() {
        let mut cache = PrefixCache::default();
        for i in 0..(DEFAULT_MAX_PREFIX_ENTRIES + 1) {
            cache.cache_prefix(&format!("prompt {i}"), vec![i as TokenId]);
        }
        assert_eq!(cache.len(), DEFAULT_MAX_PREFIX_ENTRIES);
        assert_eq!(cache.get("prompt 0"), None);
        assert!(cache.get("prompt 1").is_some());
    }

    #[test]
    fn test_reinsert_refreshes_tokens() {
        let mut cache = PrefixCache::new(10);
        cache.cache_prefix("p", vec![1]);
        cache.cache_prefix("p", vec![9, 9]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("p"), Some(&[9, 9][..]));
    }

    #[test]
    fn test_clear_and_stats() {
        let mut cache = PrefixCache::new(5);
        cache.cache_prefix("a", vec![1]);
        cache.cache_prefix("b", vec![2]);

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.max_size, 5);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().size, 0);
    }
}
