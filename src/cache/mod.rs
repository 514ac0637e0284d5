//! Bounded in-memory caches
//!
//! Process-lifetime only; nothing here persists to disk.

pub mod bounded;
pub mod prefix;

pub use bounded::{BoundedCache, CacheConfig, CacheStats, EvictionStrategy};
pub use prefix::{PrefixCache, PrefixCacheStats, DEFAULT_MAX_PREFIX_ENTRIES};
