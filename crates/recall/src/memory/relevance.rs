//! Relevance scoring for the "most relevant" read path
//!
//! Scores a memory as a weighted blend of three signals:
//! - recency of the last update (stepped: hour / day / week / older)
//! - access frequency (saturating at 100 accesses)
//! - the caller-assigned importance
//!
//! Records returned by the ranked read path get their access count bumped,
//! so frequently surfaced memories drift upward over time.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RecallError, Result};
use crate::memory::types::MemoryRecord;

/// Access count at which the frequency component saturates
pub const FREQUENCY_SATURATION: f32 = 100.0;

/// Weights for the composite relevance score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelevanceWeights {
    /// Weight of the recency component (default: 0.3)
    pub recency: f32,
    /// Weight of the access-frequency component (default: 0.2)
    pub frequency: f32,
    /// Weight of the explicit importance (default: 0.5)
    pub importance: f32,
}

impl Default for RelevanceWeights {
    fn default() -> Self {
        Self {
            recency: 0.3,
            frequency: 0.2,
            importance: 0.5,
        }
    }
}

impl RelevanceWeights {
    pub fn new(recency: f32, frequency: f32, importance: f32) -> Self {
        Self {
            recency,
            frequency,
            importance,
        }
    }

    /// Weights must be finite, non-negative, and not all zero
    pub fn validate(&self) -> Result<()> {
        let all = [self.recency, self.frequency, self.importance];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(RecallError::Config(format!(
                "relevance weights must be finite and non-negative: {self:?}"
            )));
        }
        if all.iter().all(|w| *w == 0.0) {
            return Err(RecallError::Config(
                "at least one relevance weight must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A memory paired with its composite relevance score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f32,
}

/// Stepped recency signal based on time since the last update
pub fn recency_score(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let age = now - updated_at;
    if age <= Duration::hours(1) {
        1.0
    } else if age <= Duration::days(1) {
        0.8
    } else if age <= Duration::weeks(1) {
        0.5
    } else {
        0.2
    }
}

/// Access-frequency signal, linear up to [`FREQUENCY_SATURATION`] accesses
pub fn frequency_score(access_count: u64) -> f32 {
    (access_count as f32 / FREQUENCY_SATURATION).min(1.0)
}

/// Composite relevance score for a single record
pub fn score(record: &MemoryRecord, now: DateTime<Utc>, weights: &RelevanceWeights) -> f32 {
    weights.recency * recency_score(record.updated_at, now)
        + weights.frequency * frequency_score(record.access_count)
        + weights.importance * record.importance
}

/// Rank records by composite score, highest first, keeping the top `limit`.
///
/// Equal scores are ordered by record id so repeated calls return the same
/// order.
pub fn rank(
    records: Vec<MemoryRecord>,
    now: DateTime<Utc>,
    weights: &RelevanceWeights,
    limit: usize,
) -> Vec<ScoredMemory> {
    if limit == 0 {
        return Vec::new();
    }

    let mut scored: Vec<ScoredMemory> = records
        .into_iter()
        .map(|record| {
            let score = score(&record, now, weights);
            ScoredMemory { record, score }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    scored.truncate(limit);
    scored
}
