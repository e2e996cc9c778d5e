//! Memory store facade
//!
//! Ties the cache, write buffer, query deduplicator and relevance scorer
//! together behind the public read and write surface. One instance is built
//! at the composition root and shared by reference.
//!
//! Reads flow deduplicator -> tiered cache -> store, populating the cache on
//! a miss. Writes flow buffer -> store -> owner-scoped cache invalidation.
//! Batched writes are not visible to reads until their batch is flushed.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::buffer::{BufferStats, WriteBuffer};
use crate::batch::worker::Worker;
use crate::cache::kv::KvStore;
use crate::cache::tiered::{TieredCache, TieredCacheStats};
use crate::config::Config;
use crate::dedup::QueryDeduplicator;
use crate::error::{RecallError, Result};
use crate::memory::ids::{Category, OwnerId};
use crate::memory::relevance::{RelevanceWeights, ScoredMemory, rank};
use crate::memory::types::{MemoryRecord, MemorySummary, NewMemory};
use crate::storage::backend::MemoryBackend;
use crate::storage::filter::{MAX_LIMIT, MemoryQuery, parse_categories};

const OP_BY_OWNER: &str = "by_owner";
const OP_RELEVANT: &str = "relevant";
const OP_SUMMARY: &str = "summary";

/// Parameters that identify one ranked read
#[derive(Serialize)]
struct RelevantParams<'a> {
    context: &'a str,
    categories: &'a [Category],
    limit: usize,
    window_secs: i64,
}

/// Public surface of the memory subsystem
pub struct MemoryService {
    config: Config,
    weights: RelevanceWeights,
    backend: Arc<dyn MemoryBackend>,
    cache: Arc<TieredCache>,
    buffer: WriteBuffer,
    worker: Arc<Worker>,
    record_reads: QueryDeduplicator<Vec<MemoryRecord>>,
    ranked_reads: QueryDeduplicator<Vec<ScoredMemory>>,
    summary_reads: QueryDeduplicator<MemorySummary>,
}

impl MemoryService {
    /// Build the service and start its background worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: Config,
        backend: Arc<dyn MemoryBackend>,
        kv: Arc<dyn KvStore>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(TieredCache::new(&config.cache, kv));
        let worker = Arc::new(Worker::new(config.worker.queue_capacity));
        let buffer = WriteBuffer::new(
            config.batch.clone(),
            Arc::clone(&backend),
            Arc::clone(&cache),
            Arc::clone(&worker),
        );

        info!(backend = backend.name(), "Memory service ready");
        Ok(Self {
            weights: config.ranking.weights(),
            config,
            backend,
            cache,
            buffer,
            worker,
            record_reads: QueryDeduplicator::new(),
            ranked_reads: QueryDeduplicator::new(),
            summary_reads: QueryDeduplicator::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store one memory.
    ///
    /// With `use_batch`, success means the memory was accepted for eventual
    /// persistence; store failures are retried by the buffer and never
    /// returned. Without it, the memory is upserted immediately, errors are
    /// returned, and the owner's cached reads are invalidated.
    pub async fn store(&self, memory: NewMemory, use_batch: bool) -> Result<()> {
        let item = memory.into_item()?;

        if use_batch {
            self.buffer.add(item).await;
            return Ok(());
        }

        let owner = item.owner_id.clone();
        self.backend.bulk_upsert(std::slice::from_ref(&item)).await?;
        self.cache.invalidate_owner(&owner).await;
        debug!(owner = %owner, category = %item.category, "Stored memory");
        Ok(())
    }

    /// Store many memories and persist them before returning.
    ///
    /// Every record is validated first; one invalid record rejects the whole
    /// call. Pending batched writes are flushed first, then the records are
    /// written in `batch_size` chunks without passing through the buffer.
    /// On a store error the error is returned: chunks written before the
    /// failure stay persisted and nothing is buffered or dropped.
    pub async fn store_bulk(&self, memories: Vec<NewMemory>) -> Result<usize> {
        let items = memories
            .into_iter()
            .map(NewMemory::into_item)
            .collect::<Result<Vec<_>>>()?;
        let accepted = items.len();

        self.buffer.force_flush().await?;
        self.buffer.write_through(items).await?;
        info!(accepted, "Bulk store complete");
        Ok(accepted)
    }

    /// Flush every buffered write, returning the number persisted
    pub async fn flush(&self) -> Result<usize> {
        self.buffer.force_flush().await
    }

    /// Delete an owner's memories last updated more than `age` ago.
    ///
    /// With `keep_important`, memories at or above `importance_threshold`
    /// are kept.
    pub async fn delete_old(
        &self,
        owner_id: &str,
        age: chrono::Duration,
        keep_important: bool,
        importance_threshold: f32,
    ) -> Result<usize> {
        let owner = OwnerId::try_from(owner_id)?;
        if age <= chrono::Duration::zero() {
            return Err(RecallError::InvalidInput(format!(
                "age threshold must be positive, got {age}"
            )));
        }
        if keep_important
            && (!importance_threshold.is_finite() || !(0.0..=1.0).contains(&importance_threshold))
        {
            return Err(RecallError::InvalidInput(format!(
                "importance threshold must be within [0, 1], got {importance_threshold}"
            )));
        }

        let cutoff = Utc::now().checked_sub_signed(age).ok_or_else(|| {
            RecallError::InvalidInput(format!("age threshold is out of range: {age}"))
        })?;
        let floor = keep_important.then_some(importance_threshold);
        let removed = self
            .backend
            .delete_older_than(&owner, cutoff, floor)
            .await?;

        if removed > 0 {
            self.cache.invalidate_owner(&owner).await;
        }
        info!(owner = %owner, removed, %cutoff, "Deleted old memories");
        Ok(removed)
    }

    /// Delete one memory, returning whether it existed for this owner
    pub async fn delete(&self, owner_id: &str, id: Uuid) -> Result<bool> {
        let owner = OwnerId::try_from(owner_id)?;
        let removed = self.backend.delete_by_id(&owner, id).await?;
        if removed {
            self.cache.invalidate_owner(&owner).await;
        }
        Ok(removed)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// An owner's memories, most recently updated first
    pub async fn get_by_owner(
        &self,
        owner_id: &str,
        categories: &[&str],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let owner = OwnerId::try_from(owner_id)?;
        let query = MemoryQuery::for_owner(owner.clone())
            .with_categories(normalize_categories(categories)?)
            .with_limit(limit)
            .with_offset(offset);
        query.validate()?;

        let key = self.cache.keys().key(&owner, OP_BY_OWNER, &query)?;
        self.record_reads
            .get_or_fetch(&key, || async {
                let generation = self.cache.generation(&owner);
                if let Some(records) = self.cache.get_json::<Vec<MemoryRecord>>(&key).await {
                    return Ok(records);
                }
                let records = self.backend.fetch(&query).await?;
                self.populate(&owner, generation, &key, &records).await;
                Ok(records)
            })
            .await
    }

    /// An owner's memories ranked by relevance, highest first.
    ///
    /// Candidates are drawn from memories updated within `recency_window`
    /// (the configured default when `None`). `context` distinguishes
    /// otherwise identical reads in the cache but does not affect scoring.
    /// Every returned memory has its access count incremented in the
    /// background.
    pub async fn get_relevant(
        &self,
        owner_id: &str,
        context: &str,
        categories: &[&str],
        limit: usize,
        recency_window: Option<chrono::Duration>,
    ) -> Result<Vec<ScoredMemory>> {
        let owner = OwnerId::try_from(owner_id)?;
        let categories = normalize_categories(categories)?;
        if limit == 0 || limit > MAX_LIMIT {
            return Err(RecallError::InvalidInput(format!(
                "limit must be between 1 and {MAX_LIMIT}, got {limit}"
            )));
        }
        let window = recency_window.unwrap_or_else(|| self.config.ranking.recency_window());
        if window <= chrono::Duration::zero() {
            return Err(RecallError::InvalidInput(format!(
                "recency window must be positive, got {window}"
            )));
        }

        let now = Utc::now();
        let since = now.checked_sub_signed(window).ok_or_else(|| {
            RecallError::InvalidInput(format!("recency window is out of range: {window}"))
        })?;
        let query = MemoryQuery::for_owner(owner.clone())
            .with_categories(categories.clone())
            .updated_since(since)
            .with_limit(self.config.ranking.candidate_pool.clamp(1, MAX_LIMIT));
        query.validate()?;

        let params = RelevantParams {
            context,
            categories: &categories,
            limit,
            window_secs: window.num_seconds(),
        };
        let key = self.cache.keys().key(&owner, OP_RELEVANT, &params)?;

        let ranked = self
            .ranked_reads
            .get_or_fetch(&key, || async {
                let generation = self.cache.generation(&owner);
                if let Some(ranked) = self.cache.get_json::<Vec<ScoredMemory>>(&key).await {
                    return Ok(ranked);
                }

                let candidates = self.backend.fetch(&query).await?;
                let ranked = rank(candidates, now, &self.weights, limit);

                self.populate(&owner, generation, &key, &ranked).await;
                Ok(ranked)
            })
            .await?;

        self.record_access(&owner, &ranked);
        Ok(ranked)
    }

    /// Search an owner's memories by text.
    ///
    /// Uses the store's full-text search, falling back to substring matching
    /// when that fails.
    pub async fn search(
        &self,
        owner_id: &str,
        text: &str,
        categories: &[&str],
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let owner = OwnerId::try_from(owner_id)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(RecallError::InvalidInput(
                "search text must not be empty".to_string(),
            ));
        }
        let query = MemoryQuery::for_owner(owner.clone())
            .with_categories(normalize_categories(categories)?)
            .with_limit(limit);
        query.validate()?;

        match self.backend.text_search(&query, text).await {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(owner = %owner, error = %e, "Text search failed, falling back to substring match");
                self.backend.substring_search(&query, text).await
            }
        }
    }

    /// Aggregate counts and averages over an owner's memories
    pub async fn get_summary(&self, owner_id: &str) -> Result<MemorySummary> {
        let owner = OwnerId::try_from(owner_id)?;
        let key = self.cache.keys().key(&owner, OP_SUMMARY, &())?;

        self.summary_reads
            .get_or_fetch(&key, || async {
                let generation = self.cache.generation(&owner);
                if let Some(summary) = self.cache.get_json::<MemorySummary>(&key).await {
                    return Ok(summary);
                }
                let summary = self.backend.summarize(&owner).await?;
                self.populate(&owner, generation, &key, &summary).await;
                Ok(summary)
            })
            .await
    }

    // ========================================================================
    // Lifecycle and stats
    // ========================================================================

    /// Flush buffered writes, then stop the background worker after every
    /// pending job has run.
    ///
    /// The worker is stopped even when the flush fails; the flush error is
    /// returned afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        let flushed = self.buffer.force_flush().await;
        self.worker.shutdown().await;

        let flushed = flushed?;
        info!(
            flushed,
            pending = self.buffer.pending_len(),
            "Memory service stopped"
        );
        Ok(())
    }

    pub fn cache_stats(&self) -> TieredCacheStats {
        self.cache.stats()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Cache a value fetched under `generation`. Values made stale by a
    /// write to the owner in the meantime, and serialization failures, only
    /// skip caching.
    async fn populate<T: Serialize + ?Sized>(
        &self,
        owner: &OwnerId,
        generation: u64,
        key: &str,
        value: &T,
    ) {
        if let Err(e) = self
            .cache
            .set_json_if_current(owner, generation, key, value)
            .await
        {
            warn!(key, error = %e, "Skipping cache population");
        }
    }

    /// Queue an access-count increment for each ranked memory
    fn record_access(&self, owner: &OwnerId, ranked: &[ScoredMemory]) {
        if ranked.is_empty() {
            return;
        }
        let ids: Vec<Uuid> = ranked.iter().map(|s| s.record.id).collect();
        let backend = Arc::clone(&self.backend);
        let count = ids.len();

        let queued = self.worker.try_submit(async move {
            if let Err(e) = backend.increment_access(&ids).await {
                warn!(error = %e, "Access count update failed");
            }
        });
        if !queued {
            debug!(owner = %owner, count, "Access count update skipped");
        }
    }
}

/// Parse, sort and deduplicate category names so equivalent filters share
/// a cache key
fn normalize_categories(categories: &[&str]) -> Result<Vec<Category>> {
    let mut parsed = parse_categories(categories)?;
    parsed.sort();
    parsed.dedup();
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::kv::InMemoryKv;
    use crate::storage::memory::InMemoryBackend;
    use serde_json::json;

    fn service() -> MemoryService {
        MemoryService::new(
            Config::default(),
            Arc::new(InMemoryBackend::new()),
            Arc::new(InMemoryKv::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_categories() {
        let categories = normalize_categories(&["note", "fact", "note"]).unwrap();
        let names: Vec<_> = categories.iter().map(Category::as_str).collect();
        assert_eq!(names, vec!["fact", "note"]);
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let mut config = Config::default();
        config.batch.batch_size = 0;
        let result = MemoryService::new(
            config,
            Arc::new(InMemoryBackend::new()),
            Arc::new(InMemoryKv::new()),
        );
        assert!(matches!(result, Err(RecallError::Config(_))));
    }

    #[tokio::test]
    async fn test_store_rejects_invalid_owner() {
        let service = service();
        let result = service
            .store(NewMemory::new("bad owner", "note", json!(1)), true)
            .await;
        assert!(matches!(result, Err(RecallError::InvalidInput(_))));
        assert_eq!(service.buffer_stats().pending, 0);
    }

    #[tokio::test]
    async fn test_unbatched_store_is_immediately_visible() {
        let service = service();
        service
            .store(NewMemory::new("u1", "note", json!({"x": 1})), false)
            .await
            .unwrap();

        let records = service.get_by_owner("u1", &[], 10, 0).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_search_rejects_empty_text() {
        let service = service();
        let result = service.search("u1", "   ", &[], 10).await;
        assert!(matches!(result, Err(RecallError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_get_relevant_rejects_bad_limit() {
        let service = service();
        let result = service.get_relevant("u1", "", &[], 0, None).await;
        assert!(matches!(result, Err(RecallError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_delete_old_rejects_non_positive_age() {
        let service = service();
        let result = service
            .delete_old("u1", chrono::Duration::zero(), false, 0.0)
            .await;
        assert!(matches!(result, Err(RecallError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_delete_old_rejects_out_of_range_age() {
        let service = service();
        let result = service
            .delete_old("u1", chrono::Duration::MAX, false, 0.0)
            .await;
        assert!(matches!(result, Err(RecallError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_get_relevant_rejects_out_of_range_window() {
        let service = service();
        let result = service
            .get_relevant("u1", "", &[], 10, Some(chrono::Duration::MAX))
            .await;
        assert!(matches!(result, Err(RecallError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffer() {
        let backend = Arc::new(InMemoryBackend::new());
        let service =
            MemoryService::new(Config::default(), backend.clone(), Arc::new(InMemoryKv::new()))
                .unwrap();

        service
            .store(NewMemory::new("u1", "note", json!("pending")), true)
            .await
            .unwrap();
        assert!(backend.is_empty().await);

        service.shutdown().await.unwrap();
        assert_eq!(backend.len().await, 1);
    }
}
