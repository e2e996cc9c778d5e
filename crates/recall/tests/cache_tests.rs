//! Integration tests for the two-tier cache
//!
//! Tests the cache tiers through the public API:
//! - LRU ordering and capacity bounds of the local tier
//! - Lazy TTL expiry
//! - L1 repopulation from L2 and tier independence
//! - Owner-scoped invalidation across both tiers

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use recall::cache::{InMemoryKv, KvStore, LocalCache, TieredCache};
use recall::config::CacheConfig;
use recall::memory::OwnerId;
use recall::testing::CountingKv;

fn config() -> CacheConfig {
    CacheConfig {
        l1_max_entries: 4,
        l1_ttl_secs: 300,
        l2_ttl_secs: 600,
        key_prefix: "mem".to_string(),
    }
}

fn value(n: usize) -> Bytes {
    Bytes::from(n.to_string())
}

fn owner(s: &str) -> OwnerId {
    OwnerId::try_from(s).unwrap()
}

// =============================================================================
// Local Tier
// =============================================================================

mod local_tests {
    use super::*;

    #[test]
    fn test_evicts_least_recently_accessed() {
        let cache = LocalCache::new(3, Duration::from_secs(60));
        for n in 0..3 {
            cache.set(&format!("k{n}"), value(n));
        }

        // Touch k0 and k1 so k2 is least recently used
        cache.get("k0");
        cache.get("k1");
        cache.set("k3", value(3));

        assert!(cache.get("k2").is_none());
        for key in ["k0", "k1", "k3"] {
            assert!(cache.get(key).is_some(), "{key} should survive");
        }
    }

    #[test]
    fn test_never_exceeds_capacity_under_mixed_load() {
        let cache = LocalCache::new(8, Duration::from_secs(60));
        for n in 0..500 {
            cache.set(&format!("k{}", n % 37), value(n));
            if n % 3 == 0 {
                cache.get(&format!("k{}", n % 11));
            }
            if n % 7 == 0 {
                cache.delete(&format!("k{}", n % 5));
            }
            assert!(cache.len() <= 8);
        }
    }

    #[test]
    fn test_expired_entry_stays_missing_until_reset() {
        let cache = LocalCache::new(8, Duration::from_millis(20));
        cache.set("k", value(1));
        std::thread::sleep(Duration::from_millis(40));

        assert!(cache.get("k").is_none());
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());

        cache.set("k", value(2));
        assert_eq!(cache.get("k"), Some(value(2)));
    }
}

// =============================================================================
// Tiered Cache
// =============================================================================

mod tiered_tests {
    use super::*;

    #[tokio::test]
    async fn test_l2_hit_makes_next_read_local() {
        let kv = Arc::new(CountingKv::new());
        kv.set("mem:u1:summary:x", value(1), Duration::from_secs(60))
            .await
            .unwrap();
        let cache = TieredCache::new(&config(), kv.clone());

        assert_eq!(cache.get("mem:u1:summary:x").await, Some(value(1)));
        assert_eq!(kv.gets(), 1);

        for _ in 0..5 {
            assert_eq!(cache.get("mem:u1:summary:x").await, Some(value(1)));
        }
        assert_eq!(kv.gets(), 1);
    }

    #[tokio::test]
    async fn test_l1_eviction_leaves_l2_intact() {
        let kv = Arc::new(CountingKv::new());
        let cache = TieredCache::new(&config(), kv.clone());

        for n in 0..6 {
            cache.set(&format!("k{n}"), value(n), None).await;
        }
        assert_eq!(cache.local().len(), 4);

        // k0 was evicted locally but still lives in L2
        assert_eq!(cache.get("k0").await, Some(value(0)));
        assert_eq!(kv.gets(), 1);
        assert_eq!(cache.stats().l1.evictions, 3);
    }

    #[tokio::test]
    async fn test_invalidate_owner_misses_both_tiers_afterwards() {
        let kv = Arc::new(InMemoryKv::new());
        let cache = TieredCache::new(&config(), kv.clone());
        let u1 = owner("u1");

        let keys: Vec<String> = ["by_owner", "relevant", "summary"]
            .iter()
            .map(|op| cache.keys().key(&u1, op, &()).unwrap())
            .collect();
        for key in &keys {
            cache.set(key, value(1), None).await;
        }
        let other = cache.keys().key(&owner("u1-archive"), "summary", &()).unwrap();
        cache.set(&other, value(2), None).await;

        let removed = cache.invalidate_owner(&u1).await;
        assert_eq!(removed, 6);

        for key in &keys {
            assert!(cache.get(key).await.is_none());
            assert!(kv.get(key).await.unwrap().is_none());
        }
        assert_eq!(cache.get(&other).await, Some(value(2)));
    }

    #[tokio::test]
    async fn test_clear_local_falls_back_to_l2() {
        let kv = Arc::new(CountingKv::new());
        let cache = TieredCache::new(&config(), kv.clone());

        cache.set("k", value(7), None).await;
        cache.clear_local();

        assert_eq!(cache.get("k").await, Some(value(7)));
        assert_eq!(cache.stats().l2_hits, 1);
    }
}
