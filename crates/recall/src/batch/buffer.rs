//! Write buffer for batched persistence
//!
//! Accumulates memories and writes them to the store in batches. A batch
//! is flushed synchronously once the buffer reaches `batch_size`, or by a
//! delayed flush `batch_timeout` after the first item arrives. Failed
//! batches are put back at the head of the buffer while the buffer stays
//! under its requeue cap; anything past the cap is dropped and counted.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::batch::worker::Worker;
use crate::cache::tiered::TieredCache;
use crate::config::BatchConfig;
use crate::error::Result;
use crate::memory::ids::OwnerId;
use crate::memory::types::BatchItem;
use crate::storage::backend::MemoryBackend;

/// Counters for the write buffer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BufferStats {
    /// Items waiting to be flushed
    pub pending: usize,
    /// Successful flushes
    pub flushes: u64,
    /// Items persisted by successful flushes
    pub flushed_items: u64,
    /// Flushes whose bulk upsert failed
    pub failed_flushes: u64,
    /// Items discarded because the requeue cap was reached
    pub dropped: u64,
}

#[derive(Default)]
struct BufferState {
    items: VecDeque<BatchItem>,
    timer_armed: bool,
}

struct BufferInner {
    state: Mutex<BufferState>,
    backend: Arc<dyn MemoryBackend>,
    cache: Arc<TieredCache>,
    worker: Arc<Worker>,
    config: BatchConfig,
    flushes: AtomicU64,
    flushed_items: AtomicU64,
    failed_flushes: AtomicU64,
    dropped: AtomicU64,
}

/// Size- and time-triggered write batcher
///
/// Cheap to clone; clones share the same buffer.
#[derive(Clone)]
pub struct WriteBuffer {
    inner: Arc<BufferInner>,
}

impl WriteBuffer {
    pub fn new(
        config: BatchConfig,
        backend: Arc<dyn MemoryBackend>,
        cache: Arc<TieredCache>,
        worker: Arc<Worker>,
    ) -> Self {
        info!(
            batch_size = config.batch_size,
            batch_timeout_ms = config.batch_timeout_ms,
            requeue_cap = config.requeue_cap(),
            backend = backend.name(),
            "Write buffer initialized"
        );
        Self {
            inner: Arc::new(BufferInner {
                state: Mutex::new(BufferState::default()),
                backend,
                cache,
                worker,
                config,
                flushes: AtomicU64::new(0),
                flushed_items: AtomicU64::new(0),
                failed_flushes: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept an item for eventual persistence.
    ///
    /// Reaching `batch_size` flushes synchronously before returning. A flush
    /// failure is logged and never reaches the caller.
    pub async fn add(&self, item: BatchItem) {
        let full = {
            let mut state = self.lock();
            state.items.push_back(item);
            state.items.len() >= self.inner.config.batch_size
        };

        if full {
            if let Err(e) = self.flush().await {
                warn!(error = %e, "Size-triggered flush failed, batch requeued");
            }
        }
        self.arm_timer();
    }

    /// Write up to `batch_size` items from the head of the buffer.
    ///
    /// Returns the number persisted, 0 when the buffer was empty. On failure
    /// the batch is requeued within the cap and the store error is returned.
    pub async fn flush(&self) -> Result<usize> {
        let batch: Vec<BatchItem> = {
            let mut state = self.lock();
            let take = state.items.len().min(self.inner.config.batch_size);
            state.items.drain(..take).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        match self.persist(&batch).await {
            Ok(()) => Ok(batch.len()),
            Err(e) => {
                let batch_len = batch.len();
                let dropped = self.requeue(batch);
                warn!(
                    batch = batch_len,
                    requeued = batch_len - dropped,
                    dropped,
                    error = %e,
                    "Bulk upsert failed"
                );
                Err(e)
            }
        }
    }

    /// Persist caller-held items in `batch_size` chunks, bypassing the
    /// buffer.
    ///
    /// Items never enter the shared buffer, so a failure neither requeues
    /// nor drops anything: chunks before the failing one are persisted, the
    /// rest are left with the caller and the store error is returned.
    pub async fn write_through(&self, items: Vec<BatchItem>) -> Result<usize> {
        let mut written = 0;
        for chunk in items.chunks(self.inner.config.batch_size.max(1)) {
            if let Err(e) = self.persist(chunk).await {
                warn!(
                    written,
                    remaining = items.len() - written,
                    error = %e,
                    "Write-through failed"
                );
                return Err(e);
            }
            written += chunk.len();
        }
        Ok(written)
    }

    /// One bulk upsert, then invalidation of every owner in the batch
    async fn persist(&self, batch: &[BatchItem]) -> Result<()> {
        if let Err(e) = self.inner.backend.bulk_upsert(batch).await {
            self.inner.failed_flushes.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        self.inner.flushes.fetch_add(1, Ordering::Relaxed);
        self.inner
            .flushed_items
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        let owners: BTreeSet<&OwnerId> = batch.iter().map(|i| &i.owner_id).collect();
        for owner in &owners {
            self.inner.cache.invalidate_owner(owner).await;
        }

        debug!(
            batch = batch.len(),
            owners = owners.len(),
            "Flushed write batch"
        );
        Ok(())
    }

    /// Put a failed batch back at the head, keeping its order, without
    /// growing the buffer past the cap. Returns how many items were dropped.
    fn requeue(&self, mut batch: Vec<BatchItem>) -> usize {
        let cap = self.inner.config.requeue_cap();
        let overflow = {
            let mut state = self.lock();
            let room = cap.saturating_sub(state.items.len());
            let overflow = batch.split_off(batch.len().min(room));
            for item in batch.into_iter().rev() {
                state.items.push_front(item);
            }
            overflow
        };

        for item in &overflow {
            error!(
                owner = %item.owner_id,
                category = %item.category,
                enqueued_at = %item.enqueued_at,
                "Dropping memory past requeue cap"
            );
        }
        self.inner
            .dropped
            .fetch_add(overflow.len() as u64, Ordering::Relaxed);
        overflow.len()
    }

    /// Flush until the buffer is empty, returning the total persisted.
    ///
    /// Stops at the first store error and returns it; the failed batch stays
    /// buffered within the requeue cap.
    pub async fn force_flush(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            match self.flush().await? {
                0 => break,
                n => total += n,
            }
        }
        Ok(total)
    }

    /// Schedule a delayed flush unless one is already armed or there is
    /// nothing to flush.
    ///
    /// Timers use the worker's scheduled path, so a full best-effort queue
    /// cannot prevent one from being armed.
    fn arm_timer(&self) {
        {
            let mut state = self.lock();
            if state.timer_armed || state.items.is_empty() {
                return;
            }
            state.timer_armed = true;
        }

        let buffer = self.clone();
        let timeout = self.inner.config.batch_timeout();
        let mut shutdown = self.inner.worker.shutdown_signal();
        let scheduled = self.inner.worker.schedule(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = shutdown.wait_for(|stop| *stop) => {}
            }

            buffer.lock().timer_armed = false;
            if let Err(e) = buffer.flush().await {
                warn!(error = %e, "Delayed flush failed, batch requeued");
            }
            buffer.arm_timer();
        });

        if !scheduled {
            self.lock().timer_armed = false;
            debug!("Delayed flush not scheduled, worker stopped");
        }
    }

    pub fn pending_len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            pending: self.pending_len(),
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            flushed_items: self.inner.flushed_items.load(Ordering::Relaxed),
            failed_flushes: self.inner.failed_flushes.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::kv::InMemoryKv;
    use crate::config::CacheConfig;
    use crate::memory::types::NewMemory;
    use crate::testing::{FlakyBackend, RecordingBackend};
    use serde_json::json;
    use std::time::Duration;

    fn config(batch_size: usize, batch_timeout_ms: u64) -> BatchConfig {
        BatchConfig {
            batch_size,
            batch_timeout_ms,
            requeue_factor: 3,
        }
    }

    fn cache() -> Arc<TieredCache> {
        Arc::new(TieredCache::new(
            &CacheConfig::default(),
            Arc::new(InMemoryKv::new()),
        ))
    }

    fn item(n: usize) -> BatchItem {
        NewMemory::new("u1", "note", json!({ "n": n }))
            .into_item()
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_batch_flushes_synchronously() {
        let backend = Arc::new(RecordingBackend::new());
        let buffer = WriteBuffer::new(
            config(3, 60_000),
            backend.clone(),
            cache(),
            Arc::new(Worker::new(16)),
        );

        for n in 0..3 {
            buffer.add(item(n)).await;
        }

        assert_eq!(backend.upsert_calls(), 1);
        assert_eq!(backend.upserted_items(), 3);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_after_timeout() {
        let backend = Arc::new(RecordingBackend::new());
        let buffer = WriteBuffer::new(
            config(3, 30),
            backend.clone(),
            cache(),
            Arc::new(Worker::new(16)),
        );

        buffer.add(item(0)).await;
        buffer.add(item(1)).await;
        assert_eq!(backend.upsert_calls(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.upsert_calls(), 1);
        assert_eq!(backend.upserted_items(), 2);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_flush_preserves_fifo_order() {
        let backend = Arc::new(RecordingBackend::new());
        let buffer = WriteBuffer::new(
            config(2, 60_000),
            backend.clone(),
            cache(),
            Arc::new(Worker::new(16)),
        );

        for n in 0..5 {
            buffer.add(item(n)).await;
        }
        assert_eq!(buffer.force_flush().await.unwrap(), 1);

        let batches = backend.batches();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        let order: Vec<_> = batches
            .into_iter()
            .flatten()
            .map(|i| i.content["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_at_head() {
        let backend = Arc::new(FlakyBackend::failing_times(1));
        let buffer = WriteBuffer::new(
            config(2, 60_000),
            backend.clone(),
            cache(),
            Arc::new(Worker::new(16)),
        );

        buffer.add(item(0)).await;
        buffer.add(item(1)).await;
        // The size-triggered flush failed and put both items back
        assert_eq!(buffer.pending_len(), 2);

        buffer.add(item(2)).await;
        assert_eq!(buffer.pending_len(), 1);
        assert_eq!(buffer.force_flush().await.unwrap(), 1);

        let stats = buffer.stats();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.dropped, 0);

        let order: Vec<_> = backend
            .batches()
            .into_iter()
            .flatten()
            .map(|i| i.content["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_requeue_cap_drops_excess() {
        let backend = Arc::new(FlakyBackend::always_failing());
        let buffer = WriteBuffer::new(
            config(2, 60_000),
            backend,
            cache(),
            Arc::new(Worker::new(16)),
        );

        for n in 0..10 {
            buffer.add(item(n)).await;
        }

        let stats = buffer.stats();
        assert_eq!(stats.pending, 6);
        assert_eq!(stats.dropped, 4);
        assert!(stats.failed_flushes >= 4);
    }

    #[tokio::test]
    async fn test_force_flush_propagates_error() {
        let buffer = WriteBuffer::new(
            config(10, 60_000),
            Arc::new(FlakyBackend::always_failing()),
            cache(),
            Arc::new(Worker::new(16)),
        );

        for n in 0..3 {
            buffer.add(item(n)).await;
        }
        assert!(buffer.force_flush().await.is_err());
        assert_eq!(buffer.pending_len(), 3);
    }

    #[tokio::test]
    async fn test_flush_invalidates_owner_scope() {
        let cache = cache();
        let owner = OwnerId::try_from("u1").unwrap();
        let key = cache.keys().key(&owner, "by_owner", &()).unwrap();
        cache.set_json(&key, &vec![1], None).await.unwrap();

        let buffer = WriteBuffer::new(
            config(1, 60_000),
            Arc::new(RecordingBackend::new()),
            cache.clone(),
            Arc::new(Worker::new(16)),
        );
        buffer.add(item(0)).await;

        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_fires_armed_timer() {
        let backend = Arc::new(RecordingBackend::new());
        let worker = Arc::new(Worker::new(16));
        let buffer = WriteBuffer::new(
            config(10, 3_600_000),
            backend.clone(),
            cache(),
            worker.clone(),
        );

        buffer.add(item(0)).await;
        worker.shutdown().await;

        assert_eq!(backend.upserted_items(), 1);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_timer_armed_while_worker_queue_full() {
        let backend = Arc::new(RecordingBackend::new());
        let worker = Arc::new(Worker::new(1));
        assert!(worker.try_submit(async {}));
        assert!(!worker.try_submit(async {}));

        let buffer = WriteBuffer::new(config(10, 30), backend.clone(), cache(), worker);
        buffer.add(item(0)).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(backend.upserted_items(), 1);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_write_through_chunks_by_batch_size() {
        let backend = Arc::new(RecordingBackend::new());
        let buffer = WriteBuffer::new(
            config(2, 60_000),
            backend.clone(),
            cache(),
            Arc::new(Worker::new(16)),
        );

        let written = buffer.write_through((0..5).map(item).collect()).await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(
            backend.batches().iter().map(Vec::len).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert_eq!(buffer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_write_through_failure_leaves_buffer_untouched() {
        let backend = Arc::new(FlakyBackend::failing_times(1));
        let buffer = WriteBuffer::new(
            config(2, 30),
            backend.clone(),
            cache(),
            Arc::new(Worker::new(16)),
        );

        let result = buffer.write_through((0..10).map(item).collect()).await;
        assert!(result.is_err());

        let stats = buffer.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.failed_flushes, 1);

        // Nothing is left behind for a timer to pick up later
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(backend.store().is_empty().await);
    }
}
