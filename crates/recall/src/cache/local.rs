//! In-process cache tier (L1)
//!
//! Bounded LRU cache with per-entry time-to-live. Expiry is lazy: an entry
//! past its TTL is removed the next time it is read, there is no background
//! sweeper. All access goes through a single mutex so the cache stays
//! correct when shared across worker threads.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;

/// Default capacity for the local cache
pub const DEFAULT_LOCAL_CAPACITY: usize = 1000;

/// A cached value and when it was stored
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Bytes,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    fn new(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

/// Counters and sizing for the local tier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocalCacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Bounded LRU cache with lazy TTL expiry
#[derive(Debug)]
pub struct LocalCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalCache {
    /// Creates a new cache holding at most `capacity` entries.
    ///
    /// A capacity of 0 falls back to [`DEFAULT_LOCAL_CAPACITY`].
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_LOCAL_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a key, marking it most recently used.
    ///
    /// An entry older than its TTL is evicted and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut entries = self.lock();

        let expired = match entries.peek(key) {
            Some(entry) => entry.is_expired(Instant::now()),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            entries.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Stores a value with the default TTL
    pub fn set(&self, key: &str, value: Bytes) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Stores a value with an explicit TTL.
    ///
    /// An existing key is replaced in place. At capacity, the single least
    /// recently used entry is evicted first.
    pub fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) {
        let mut entries = self.lock();
        if let Some((evicted, _)) = entries.push(key.to_string(), CacheEntry::new(value, ttl)) {
            if evicted != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Removes a key, returning whether it was present
    pub fn delete(&self, key: &str) -> bool {
        self.lock().pop(key).is_some()
    }

    /// Removes every key containing `fragment`, returning how many were removed
    pub fn invalidate_matching(&self, fragment: &str) -> usize {
        let mut entries = self.lock();
        let matching: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.contains(fragment))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &matching {
            entries.pop(key.as_str());
        }
        matching.len()
    }

    /// Removes all entries
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn stats(&self) -> LocalCacheStats {
        let entries = self.lock();
        LocalCacheStats {
            size: entries.len(),
            capacity: entries.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_CAPACITY, Duration::from_secs(300))
    }
}
