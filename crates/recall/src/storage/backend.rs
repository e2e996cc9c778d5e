//! Persistent store trait for memories
//!
//! Defines the MemoryBackend trait that abstracts the durable memory store
//! (a relational database in production, an in-process map for single-node
//! runs and tests).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::memory::ids::OwnerId;
use crate::memory::types::{BatchItem, MemoryRecord, MemorySummary};
use crate::storage::filter::MemoryQuery;

/// Trait for durable memory stores
///
/// Every read is scoped to a single owner through the query it receives.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Insert or merge a batch of items in a single operation.
    ///
    /// Items collide on `(owner_id, category, content_hash)`. On collision
    /// the stored importance becomes the maximum of old and new, the access
    /// count is incremented, the update timestamp is refreshed and metadata
    /// is replaced. Returns the number of items applied.
    async fn bulk_upsert(&self, items: &[BatchItem]) -> Result<usize>;

    /// Records matching the query, newest update first, ties broken by id
    async fn fetch(&self, query: &MemoryQuery) -> Result<Vec<MemoryRecord>>;

    /// Ranked full-text search within the query's scope.
    ///
    /// Returns `RecallError::SearchUnavailable` when the store has no text index.
    async fn text_search(&self, query: &MemoryQuery, text: &str) -> Result<Vec<MemoryRecord>>;

    /// Case-insensitive substring match over content, newest update first
    async fn substring_search(&self, query: &MemoryQuery, text: &str)
    -> Result<Vec<MemoryRecord>>;

    /// Aggregate counters over all of an owner's memories
    async fn summarize(&self, owner: &OwnerId) -> Result<MemorySummary>;

    /// Delete an owner's memories last updated before `cutoff`.
    ///
    /// With `importance_floor`, only memories strictly below that importance
    /// are deleted. Returns the number removed.
    async fn delete_older_than(
        &self,
        owner: &OwnerId,
        cutoff: DateTime<Utc>,
        importance_floor: Option<f32>,
    ) -> Result<usize>;

    /// Delete a single memory, returning whether it existed for this owner
    async fn delete_by_id(&self, owner: &OwnerId, id: Uuid) -> Result<bool>;

    /// Increment the access count of each listed memory, ignoring unknown ids
    async fn increment_access(&self, ids: &[Uuid]) -> Result<usize>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}
