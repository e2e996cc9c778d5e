//! Two-tier cache: in-process L1 in front of a shared L2
//!
//! Reads consult L1 first and only go to L2 on a miss, repopulating L1 from
//! an L2 hit. Writes go to both tiers. The tiers are independent expiry
//! domains: evicting from one never touches the other.
//!
//! Each owner maps onto one of a fixed set of generation counters that
//! invalidation bumps. A read that fetched before an invalidation passes the
//! generation it started under to [`TieredCache::set_json_if_current`], which
//! refuses to cache the now-stale value.
//!
//! L2 is best-effort. Any L2 error is logged and treated as a miss (reads)
//! or ignored (writes and invalidation); it never reaches the caller.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::cache::key::CacheKeys;
use crate::cache::kv::KvStore;
use crate::cache::local::{LocalCache, LocalCacheStats};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::memory::ids::OwnerId;

/// Number of owner generation counters. Owners sharing a counter only cost
/// each other skipped cache populations.
const GENERATION_STRIPES: usize = 64;

/// Combined statistics for both tiers
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TieredCacheStats {
    pub l1: LocalCacheStats,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l2_errors: u64,
    /// Populations skipped because the owner was invalidated mid-read
    pub stale_skips: u64,
}

/// L1 + L2 cache with owner-scoped invalidation
pub struct TieredCache {
    l1: LocalCache,
    l2: Arc<dyn KvStore>,
    l2_ttl: Duration,
    keys: CacheKeys,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_errors: AtomicU64,
    stale_skips: AtomicU64,
    generations: [AtomicU64; GENERATION_STRIPES],
}

impl TieredCache {
    pub fn new(config: &CacheConfig, l2: Arc<dyn KvStore>) -> Self {
        debug!(
            l1_max_entries = config.l1_max_entries,
            l1_ttl_secs = config.l1_ttl_secs,
            l2_ttl_secs = config.l2_ttl_secs,
            l2 = l2.name(),
            "TieredCache initialized"
        );
        Self {
            l1: LocalCache::new(config.l1_max_entries, config.l1_ttl()),
            l2,
            l2_ttl: config.l2_ttl(),
            keys: CacheKeys::new(config.key_prefix.clone()),
            l2_hits: AtomicU64::new(0),
            l2_misses: AtomicU64::new(0),
            l2_errors: AtomicU64::new(0),
            stale_skips: AtomicU64::new(0),
            generations: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn generation_slot(&self, owner: &OwnerId) -> &AtomicU64 {
        let mut hasher = DefaultHasher::new();
        owner.hash(&mut hasher);
        &self.generations[(hasher.finish() % GENERATION_STRIPES as u64) as usize]
    }

    /// Current invalidation generation for `owner`.
    ///
    /// Read it before fetching from the store and hand it back to
    /// [`TieredCache::set_json_if_current`].
    pub fn generation(&self, owner: &OwnerId) -> u64 {
        self.generation_slot(owner).load(Ordering::Acquire)
    }

    /// Key builder scoped to this cache's prefix
    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    /// The in-process tier
    pub fn local(&self) -> &LocalCache {
        &self.l1
    }

    /// Look up a key in L1, then L2.
    ///
    /// An L2 hit is copied into L1 with L1's default TTL.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(value) = self.l1.get(key) {
            return Some(value);
        }

        match self.l2.get(key).await {
            Ok(Some(value)) => {
                self.l2_hits.fetch_add(1, Ordering::Relaxed);
                self.l1.set(key, value.clone());
                Some(value)
            }
            Ok(None) => {
                self.l2_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = key, error = %e, "L2 cache read failed, treating as miss");
                None
            }
        }
    }

    /// Look up and deserialize a JSON value.
    ///
    /// A value that no longer deserializes is dropped from both tiers and
    /// reported as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = key, error = %e, "Discarding undecodable cache entry");
                self.delete(key).await;
                None
            }
        }
    }

    /// Write to L1, then attempt L2.
    ///
    /// `ttl` overrides the L2 TTL and caps the L1 TTL.
    pub async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let l1_ttl = ttl.map_or(self.l1.default_ttl(), |t| t.min(self.l1.default_ttl()));
        self.l1.set_with_ttl(key, value.clone(), l1_ttl);

        if let Err(e) = self.l2.set(key, value, ttl.unwrap_or(self.l2_ttl)).await {
            self.l2_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key = key, error = %e, "L2 cache write failed");
        }
    }

    /// Serialize a value as JSON and write it to both tiers
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = Bytes::from(serde_json::to_vec(value)?);
        self.set(key, bytes, ttl).await;
        Ok(())
    }

    /// Cache a value fetched for `owner` only if no invalidation of that
    /// owner happened since `generation` was read.
    ///
    /// An invalidation racing the write itself is caught by a second check
    /// that removes the just-written key. Returns whether the value stayed
    /// cached.
    pub async fn set_json_if_current<T: Serialize + ?Sized>(
        &self,
        owner: &OwnerId,
        generation: u64,
        key: &str,
        value: &T,
    ) -> Result<bool> {
        if self.generation(owner) != generation {
            self.stale_skips.fetch_add(1, Ordering::Relaxed);
            debug!(owner = %owner, key = key, "Skipping population of stale read");
            return Ok(false);
        }

        self.set_json(key, value, None).await?;

        if self.generation(owner) != generation {
            self.stale_skips.fetch_add(1, Ordering::Relaxed);
            self.delete(key).await;
            debug!(owner = %owner, key = key, "Removed population raced by invalidation");
            return Ok(false);
        }
        Ok(true)
    }

    /// Remove a key from both tiers, returning whether either held it
    pub async fn delete(&self, key: &str) -> bool {
        let in_l1 = self.l1.delete(key);
        let in_l2 = match self.l2.delete(key).await {
            Ok(found) => found,
            Err(e) => {
                self.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = key, error = %e, "L2 cache delete failed");
                false
            }
        };
        in_l1 || in_l2
    }

    /// Remove every key belonging to `owner` from both tiers.
    ///
    /// Returns the total removed. L2 failures are logged and contribute
    /// nothing to the count.
    pub async fn invalidate_owner(&self, owner: &OwnerId) -> usize {
        self.generation_slot(owner).fetch_add(1, Ordering::AcqRel);
        let local = self.l1.invalidate_matching(&self.keys.owner_fragment(owner));

        let shared = match self.l2.delete_matching(&self.keys.owner_pattern(owner)).await {
            Ok(count) => count,
            Err(e) => {
                self.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(owner = %owner, error = %e, "L2 owner invalidation failed");
                0
            }
        };

        debug!(owner = %owner, local, shared, "Invalidated owner cache scope");
        local + shared
    }

    /// Drop everything from L1. L2 is left to expire on its own.
    pub fn clear_local(&self) {
        self.l1.clear();
    }

    pub fn stats(&self) -> TieredCacheStats {
        TieredCacheStats {
            l1: self.l1.stats(),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.l2_misses.load(Ordering::Relaxed),
            l2_errors: self.l2_errors.load(Ordering::Relaxed),
            stale_skips: self.stale_skips.load(Ordering::Relaxed),
        }
    }
}
