//! Shared key-value tier (L2)
//!
//! Defines the KvStore trait that abstracts the larger, shared cache tier
//! (Redis, Memcached, ...) and an in-process implementation used for
//! single-node deployments and tests. No durability is expected of this tier.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use globset::{Glob, GlobMatcher};

use crate::error::{RecallError, Result};

/// Trait for shared key-value cache backends
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value, `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a value that expires after `ttl`
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Remove a key, returning whether it was present
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Scan the keyspace for keys matching a glob pattern (`*`, `?`) and
    /// delete them, returning how many were removed
    async fn delete_matching(&self, pattern: &str) -> Result<usize>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// In-process key-value tier backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryKv {
    entries: DashMap<String, (Bytes, Instant)>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including any not yet purged after expiry
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        self.entries
            .remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let matcher = key_matcher(pattern)?;
        let mut removed = 0;
        self.entries.retain(|key, _| {
            if matcher.is_match(key) {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

/// Compile a key pattern. `*` and `?` match any characters, including `:`.
pub fn key_matcher(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|e| RecallError::Cache(format!("invalid key pattern {pattern:?}: {e}")))
}
