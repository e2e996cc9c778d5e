//! Memory types for the Recall system
//!
//! Defines the persisted memory record, the pre-persistence batch item that
//! mirrors it, and the aggregate summary returned for an owner.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{RecallError, Result};
use crate::memory::ids::{Category, OwnerId};

/// A single memory record as held by the persistent store.
///
/// Unique per `(owner_id, category, content_hash)`. Cached copies are
/// read-only shadows and may be stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier assigned by the store
    pub id: Uuid,
    /// Owner this memory belongs to
    pub owner_id: OwnerId,
    /// Classification of the memory
    pub category: Category,
    /// Structured content of the memory
    pub content: serde_json::Value,
    /// Explicit importance (0.0-1.0)
    pub importance: f32,
    /// Free-form metadata
    pub metadata: serde_json::Value,
    /// How many times this memory has been stored again or returned as relevant
    pub access_count: u64,
    /// When this memory was first stored
    pub created_at: DateTime<Utc>,
    /// When this memory was last merged or touched
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Build a freshly persisted record from a batch item
    pub fn from_item(item: &BatchItem) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: item.owner_id.clone(),
            category: item.category.clone(),
            content: item.content.clone(),
            importance: item.importance,
            metadata: item.metadata.clone(),
            access_count: 0,
            created_at: item.created_at,
            updated_at: item.created_at,
        }
    }

    /// Hash of the record's content, part of its uniqueness key
    pub fn content_hash(&self) -> String {
        content_hash(&self.content)
    }

    /// Content rendered as text for search matching
    pub fn content_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A memory waiting in the write buffer.
///
/// Mirrors [`MemoryRecord`] without the store-assigned `id` and
/// `access_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub owner_id: OwnerId,
    pub category: Category,
    pub content: serde_json::Value,
    pub importance: f32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// When the item entered the write buffer
    pub enqueued_at: DateTime<Utc>,
}

impl BatchItem {
    /// Uniqueness key used by the store's upsert
    pub fn unique_key(&self) -> (OwnerId, Category, String) {
        (
            self.owner_id.clone(),
            self.category.clone(),
            content_hash(&self.content),
        )
    }
}

/// Caller-facing input for storing a memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub owner_id: String,
    pub category: String,
    pub content: serde_json::Value,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_importance() -> f32 {
    0.5
}

impl NewMemory {
    pub fn new(owner_id: &str, category: &str, content: serde_json::Value) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            category: category.to_string(),
            content,
            importance: default_importance(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Validate identifiers and importance, producing a batch item
    pub fn into_item(self) -> Result<BatchItem> {
        let owner_id = OwnerId::try_from(self.owner_id)?;
        let category = Category::try_from(self.category)?;
        if !self.importance.is_finite() || !(0.0..=1.0).contains(&self.importance) {
            return Err(RecallError::InvalidInput(format!(
                "importance must be within [0, 1], got {}",
                self.importance
            )));
        }

        let now = Utc::now();
        Ok(BatchItem {
            owner_id,
            category,
            content: self.content,
            importance: self.importance,
            metadata: self.metadata,
            created_at: now,
            enqueued_at: now,
        })
    }
}

/// Aggregate view over an owner's memories
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemorySummary {
    pub total: u64,
    pub average_importance: f32,
    pub total_accesses: u64,
    /// Number of memories per category
    pub categories: BTreeMap<String, u64>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl MemorySummary {
    /// Fold a set of records into a summary
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a MemoryRecord>) -> Self {
        let mut summary = MemorySummary::default();
        let mut importance_sum = 0.0_f64;

        for record in records {
            summary.total += 1;
            importance_sum += f64::from(record.importance);
            summary.total_accesses += record.access_count;
            *summary
                .categories
                .entry(record.category.to_string())
                .or_insert(0) += 1;
            summary.oldest = Some(match summary.oldest {
                Some(t) => t.min(record.created_at),
                None => record.created_at,
            });
            summary.newest = Some(match summary.newest {
                Some(t) => t.max(record.updated_at),
                None => record.updated_at,
            });
        }

        if summary.total > 0 {
            summary.average_importance = (importance_sum / summary.total as f64) as f32;
        }
        summary
    }
}

/// SHA-256 of the canonical JSON rendering of a content value.
///
/// `serde_json` maps are key-ordered, so equal values hash equally
/// regardless of the order fields were written in.
pub fn content_hash(content: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
