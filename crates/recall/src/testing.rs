//! Test utilities for recall - instrumented doubles
//!
//! This module provides wrappers around the in-process stores that count
//! calls or inject failures, for unit and integration tests:
//! - `CountingKv` / `FailingKv` for the shared cache tier
//! - `RecordingBackend`, `FlakyBackend`, `SearchlessBackend` for the
//!   persistent store

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cache::kv::{InMemoryKv, KvStore};
use crate::error::{RecallError, Result};
use crate::memory::ids::OwnerId;
use crate::memory::types::{BatchItem, MemoryRecord, MemorySummary};
use crate::storage::backend::MemoryBackend;
use crate::storage::filter::MemoryQuery;
use crate::storage::memory::InMemoryBackend;

/// Key-value tier that counts reads and writes.
#[derive(Debug, Default)]
pub struct CountingKv {
    inner: InMemoryKv,
    gets: AtomicUsize,
    sets: AtomicUsize,
}

impl CountingKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls that reached this tier
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvStore for CountingKv {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        self.inner.delete_matching(pattern).await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// Key-value tier whose every operation fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingKv;

#[async_trait]
impl KvStore for FailingKv {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
        Err(RecallError::Cache("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<()> {
        Err(RecallError::Cache("connection refused".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Err(RecallError::Cache("connection refused".to_string()))
    }

    async fn delete_matching(&self, _pattern: &str) -> Result<usize> {
        Err(RecallError::Cache("connection refused".to_string()))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Store that records every applied batch and counts reads.
///
/// An optional fetch delay holds each read's result back after it was taken,
/// modelling a slow response that concurrent reads and writes can overlap.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    inner: InMemoryBackend,
    batches: Mutex<Vec<Vec<BatchItem>>>,
    fetches: AtomicUsize,
    summaries: AtomicUsize,
    increments: AtomicUsize,
    fetch_delay: Option<Duration>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_delay(delay: Duration) -> Self {
        Self {
            fetch_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Number of successful `bulk_upsert` calls
    pub fn upsert_calls(&self) -> usize {
        self.batches().len()
    }

    /// Total items across all successful `bulk_upsert` calls
    pub fn upserted_items(&self) -> usize {
        self.batches().iter().map(Vec::len).sum()
    }

    /// Every applied batch, in call order
    pub fn batches(&self) -> Vec<Vec<BatchItem>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn summary_calls(&self) -> usize {
        self.summaries.load(Ordering::SeqCst)
    }

    pub fn increment_calls(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }

    /// The wrapped store, for direct inspection
    pub fn store(&self) -> &InMemoryBackend {
        &self.inner
    }
}

#[async_trait]
impl MemoryBackend for RecordingBackend {
    async fn bulk_upsert(&self, items: &[BatchItem]) -> Result<usize> {
        let applied = self.inner.bulk_upsert(items).await?;
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(items.to_vec());
        Ok(applied)
    }

    async fn fetch(&self, query: &MemoryQuery) -> Result<Vec<MemoryRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let records = self.inner.fetch(query).await;
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        records
    }

    async fn text_search(&self, query: &MemoryQuery, text: &str) -> Result<Vec<MemoryRecord>> {
        self.inner.text_search(query, text).await
    }

    async fn substring_search(
        &self,
        query: &MemoryQuery,
        text: &str,
    ) -> Result<Vec<MemoryRecord>> {
        self.inner.substring_search(query, text).await
    }

    async fn summarize(&self, owner: &OwnerId) -> Result<MemorySummary> {
        self.summaries.fetch_add(1, Ordering::SeqCst);
        self.inner.summarize(owner).await
    }

    async fn delete_older_than(
        &self,
        owner: &OwnerId,
        cutoff: DateTime<Utc>,
        importance_floor: Option<f32>,
    ) -> Result<usize> {
        self.inner
            .delete_older_than(owner, cutoff, importance_floor)
            .await
    }

    async fn delete_by_id(&self, owner: &OwnerId, id: Uuid) -> Result<bool> {
        self.inner.delete_by_id(owner, id).await
    }

    async fn increment_access(&self, ids: &[Uuid]) -> Result<usize> {
        self.increments.fetch_add(1, Ordering::SeqCst);
        self.inner.increment_access(ids).await
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Store whose `bulk_upsert` fails a set number of times before recovering.
#[derive(Debug, Default)]
pub struct FlakyBackend {
    inner: RecordingBackend,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyBackend {
    /// Fail the first `n` upserts, then succeed
    pub fn failing_times(n: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    /// Fail every upsert
    pub fn always_failing() -> Self {
        Self::failing_times(usize::MAX)
    }

    /// Upsert calls, failed or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Batches that were applied
    pub fn batches(&self) -> Vec<Vec<BatchItem>> {
        self.inner.batches()
    }

    pub fn store(&self) -> &InMemoryBackend {
        self.inner.store()
    }
}

#[async_trait]
impl MemoryBackend for FlakyBackend {
    async fn bulk_upsert(&self, items: &[BatchItem]) -> Result<usize> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(RecallError::Storage("deadlock detected".to_string()));
        }
        self.inner.bulk_upsert(items).await
    }

    async fn fetch(&self, query: &MemoryQuery) -> Result<Vec<MemoryRecord>> {
        self.inner.fetch(query).await
    }

    async fn text_search(&self, query: &MemoryQuery, text: &str) -> Result<Vec<MemoryRecord>> {
        self.inner.text_search(query, text).await
    }

    async fn substring_search(
        &self,
        query: &MemoryQuery,
        text: &str,
    ) -> Result<Vec<MemoryRecord>> {
        self.inner.substring_search(query, text).await
    }

    async fn summarize(&self, owner: &OwnerId) -> Result<MemorySummary> {
        self.inner.summarize(owner).await
    }

    async fn delete_older_than(
        &self,
        owner: &OwnerId,
        cutoff: DateTime<Utc>,
        importance_floor: Option<f32>,
    ) -> Result<usize> {
        self.inner
            .delete_older_than(owner, cutoff, importance_floor)
            .await
    }

    async fn delete_by_id(&self, owner: &OwnerId, id: Uuid) -> Result<bool> {
        self.inner.delete_by_id(owner, id).await
    }

    async fn increment_access(&self, ids: &[Uuid]) -> Result<usize> {
        self.inner.increment_access(ids).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

/// Store without a text index that counts which search path served a query.
#[derive(Debug)]
pub struct SearchlessBackend {
    inner: InMemoryBackend,
    text_searches: AtomicUsize,
    substring_searches: AtomicUsize,
}

impl SearchlessBackend {
    pub fn new() -> Self {
        Self {
            inner: InMemoryBackend::without_text_search(),
            text_searches: AtomicUsize::new(0),
            substring_searches: AtomicUsize::new(0),
        }
    }

    pub fn text_searches(&self) -> usize {
        self.text_searches.load(Ordering::SeqCst)
    }

    pub fn substring_searches(&self) -> usize {
        self.substring_searches.load(Ordering::SeqCst)
    }
}

impl Default for SearchlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryBackend for SearchlessBackend {
    async fn bulk_upsert(&self, items: &[BatchItem]) -> Result<usize> {
        self.inner.bulk_upsert(items).await
    }

    async fn fetch(&self, query: &MemoryQuery) -> Result<Vec<MemoryRecord>> {
        self.inner.fetch(query).await
    }

    async fn text_search(&self, query: &MemoryQuery, text: &str) -> Result<Vec<MemoryRecord>> {
        self.text_searches.fetch_add(1, Ordering::SeqCst);
        self.inner.text_search(query, text).await
    }

    async fn substring_search(
        &self,
        query: &MemoryQuery,
        text: &str,
    ) -> Result<Vec<MemoryRecord>> {
        self.substring_searches.fetch_add(1, Ordering::SeqCst);
        self.inner.substring_search(query, text).await
    }

    async fn summarize(&self, owner: &OwnerId) -> Result<MemorySummary> {
        self.inner.summarize(owner).await
    }

    async fn delete_older_than(
        &self,
        owner: &OwnerId,
        cutoff: DateTime<Utc>,
        importance_floor: Option<f32>,
    ) -> Result<usize> {
        self.inner
            .delete_older_than(owner, cutoff, importance_floor)
            .await
    }

    async fn delete_by_id(&self, owner: &OwnerId, id: Uuid) -> Result<bool> {
        self.inner.delete_by_id(owner, id).await
    }

    async fn increment_access(&self, ids: &[Uuid]) -> Result<usize> {
        self.inner.increment_access(ids).await
    }

    fn name(&self) -> &'static str {
        "searchless"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::NewMemory;
    use serde_json::json;

    fn item() -> BatchItem {
        NewMemory::new("u1", "note", json!("x")).into_item().unwrap()
    }

    #[tokio::test]
    async fn flaky_backend_recovers_after_failures() {
        let backend = FlakyBackend::failing_times(2);
        assert!(backend.bulk_upsert(&[item()]).await.is_err());
        assert!(backend.bulk_upsert(&[item()]).await.is_err());
        assert!(backend.bulk_upsert(&[item()]).await.is_ok());
        assert_eq!(backend.attempts(), 3);
        assert_eq!(backend.batches().len(), 1);
    }

    #[tokio::test]
    async fn always_failing_backend_never_recovers() {
        let backend = FlakyBackend::always_failing();
        for _ in 0..5 {
            assert!(backend.bulk_upsert(&[item()]).await.is_err());
        }
        assert!(backend.batches().is_empty());
    }

    #[tokio::test]
    async fn counting_kv_counts_gets() {
        let kv = CountingKv::new();
        kv.get("a").await.unwrap();
        kv.set("a", Bytes::from_static(b"1"), Duration::from_secs(1))
            .await
            .unwrap();
        kv.get("a").await.unwrap();
        assert_eq!(kv.gets(), 2);
        assert_eq!(kv.sets(), 1);
    }
}
