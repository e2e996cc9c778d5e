//! Cache key encoding
//!
//! Keys have the shape `{prefix}:{owner}:{operation}:{fingerprint}`. The
//! owner segment is validated to `[A-Za-z0-9_-]`, so `{prefix}:{owner}:`
//! identifies exactly one owner's keys for both substring (L1) and glob (L2)
//! invalidation.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::memory::ids::OwnerId;

/// Number of hex characters kept from the SHA-256 digest
const FINGERPRINT_LEN: usize = 32;

/// Deterministic digest of a read's parameters
pub fn fingerprint<P: Serialize + ?Sized>(params: &P) -> Result<String> {
    let encoded = serde_json::to_vec(params)?;
    let digest = Sha256::digest(&encoded);
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_LEN);
    Ok(hex)
}

/// Builds cache keys and owner-scoped invalidation patterns
#[derive(Debug, Clone)]
pub struct CacheKeys {
    prefix: String,
}

impl CacheKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key for one read operation of one owner
    pub fn key<P: Serialize + ?Sized>(
        &self,
        owner: &OwnerId,
        operation: &str,
        params: &P,
    ) -> Result<String> {
        Ok(format!(
            "{}:{}:{}:{}",
            self.prefix,
            owner,
            operation,
            fingerprint(params)?
        ))
    }

    /// Substring shared by every key of `owner`
    pub fn owner_fragment(&self, owner: &OwnerId) -> String {
        format!("{}:{}:", self.prefix, owner)
    }

    /// Glob pattern matching every key of `owner`
    pub fn owner_pattern(&self, owner: &OwnerId) -> String {
        format!("{}:{}:*", self.prefix, owner)
    }
}

impl Default for CacheKeys {
    fn default() -> Self {
        Self::new("mem")
    }
}
