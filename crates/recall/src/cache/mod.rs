//! Two-tier caching for memory reads
//!
//! A bounded in-process LRU (L1) sits in front of a shared key-value tier
//! (L2). Keys are scoped by owner so every cached read for an owner can be
//! invalidated together after a write.

pub mod key;
pub mod kv;
pub mod local;
pub mod tiered;

pub use key::{CacheKeys, fingerprint};
pub use kv::{InMemoryKv, KvStore};
pub use local::{CacheEntry, LocalCache, LocalCacheStats};
pub use tiered::{TieredCache, TieredCacheStats};
