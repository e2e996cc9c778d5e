//! In-process persistent store
//!
//! Holds records in a map keyed on `(owner_id, category, content_hash)`,
//! mirroring the uniqueness constraint of the relational store, and applies
//! the same merge rules on upsert. Used by the binary and by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{RecallError, Result};
use crate::memory::ids::{Category, OwnerId};
use crate::memory::types::{BatchItem, MemoryRecord, MemorySummary};
use crate::storage::backend::MemoryBackend;
use crate::storage::filter::MemoryQuery;

type RecordKey = (OwnerId, Category, String);

/// Map-backed memory store
#[derive(Debug)]
pub struct InMemoryBackend {
    records: RwLock<HashMap<RecordKey, MemoryRecord>>,
    text_search: bool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            text_search: true,
        }
    }

    /// A store without a full-text index; `text_search` always fails
    pub fn without_text_search() -> Self {
        Self {
            text_search: false,
            ..Self::new()
        }
    }

    /// Total number of stored records across all owners
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Look up a record by id regardless of owner
    pub async fn get(&self, id: Uuid) -> Option<MemoryRecord> {
        self.records
            .read()
            .await
            .values()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Overwrite a stored record's update timestamp
    pub async fn set_updated_at(&self, id: Uuid, updated_at: DateTime<Utc>) -> bool {
        let mut records = self.records.write().await;
        match records.values_mut().find(|r| r.id == id) {
            Some(record) => {
                record.updated_at = updated_at;
                true
            }
            None => false,
        }
    }

    async fn matching(&self, query: &MemoryQuery) -> Vec<MemoryRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Newest update first, ties broken by id
fn sort_by_recency(records: &mut [MemoryRecord]) {
    records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
}

fn search_terms(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn bulk_upsert(&self, items: &[BatchItem]) -> Result<usize> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let mut merged = 0;

        for item in items {
            match records.get_mut(&item.unique_key()) {
                Some(existing) => {
                    existing.importance = existing.importance.max(item.importance);
                    existing.access_count += 1;
                    existing.updated_at = now;
                    existing.metadata = item.metadata.clone();
                    merged += 1;
                }
                None => {
                    records.insert(item.unique_key(), MemoryRecord::from_item(item));
                }
            }
        }

        debug!(items = items.len(), merged, "Applied bulk upsert");
        Ok(items.len())
    }

    async fn fetch(&self, query: &MemoryQuery) -> Result<Vec<MemoryRecord>> {
        query.validate()?;
        let mut records = self.matching(query).await;
        sort_by_recency(&mut records);
        Ok(query.paginate(records))
    }

    async fn text_search(&self, query: &MemoryQuery, text: &str) -> Result<Vec<MemoryRecord>> {
        if !self.text_search {
            return Err(RecallError::SearchUnavailable(
                "in-memory store has no text index".to_string(),
            ));
        }
        query.validate()?;

        let terms = search_terms(text);
        let mut hits: Vec<(usize, MemoryRecord)> = self
            .matching(query)
            .await
            .into_iter()
            .filter_map(|record| {
                let haystack = record.content_text().to_lowercase();
                let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (matched > 0).then_some((matched, record))
            })
            .collect();

        hits.sort_by(|(ma, a), (mb, b)| {
            mb.cmp(ma)
                .then(b.updated_at.cmp(&a.updated_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(query.paginate(hits.into_iter().map(|(_, r)| r).collect()))
    }

    async fn substring_search(
        &self,
        query: &MemoryQuery,
        text: &str,
    ) -> Result<Vec<MemoryRecord>> {
        query.validate()?;
        let needle = text.to_lowercase();
        let mut records: Vec<MemoryRecord> = self
            .matching(query)
            .await
            .into_iter()
            .filter(|r| r.content_text().to_lowercase().contains(&needle))
            .collect();
        sort_by_recency(&mut records);
        Ok(query.paginate(records))
    }

    async fn summarize(&self, owner: &OwnerId) -> Result<MemorySummary> {
        let records = self.records.read().await;
        Ok(MemorySummary::from_records(
            records.values().filter(|r| &r.owner_id == owner),
        ))
    }

    async fn delete_older_than(
        &self,
        owner: &OwnerId,
        cutoff: DateTime<Utc>,
        importance_floor: Option<f32>,
    ) -> Result<usize> {
        let mut query = MemoryQuery::for_owner(owner.clone()).updated_before(cutoff);
        if let Some(floor) = importance_floor {
            query = query.importance_below(floor);
        }
        query.validate()?;

        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !query.matches(record));
        Ok(before - records.len())
    }

    async fn delete_by_id(&self, owner: &OwnerId, id: Uuid) -> Result<bool> {
        let mut records = self.records.write().await;
        let key = records
            .iter()
            .find(|(_, r)| r.id == id && &r.owner_id == owner)
            .map(|(k, _)| k.clone());
        Ok(key.is_some_and(|k| records.remove(&k).is_some()))
    }

    async fn increment_access(&self, ids: &[Uuid]) -> Result<usize> {
        let mut records = self.records.write().await;
        let mut touched = 0;
        for record in records.values_mut() {
            if ids.contains(&record.id) {
                record.access_count += 1;
                touched += 1;
            }
        }
        Ok(touched)
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}
