//! Memory types and ranking
//!
//! Defines the memory record model, validated identifiers, and the
//! relevance scorer used by the ranked read path.

pub mod ids;
pub mod relevance;
pub mod types;

pub use ids::{Category, IdError, OwnerId};
pub use relevance::{RelevanceWeights, ScoredMemory, rank};
pub use types::{BatchItem, MemoryRecord, MemorySummary, NewMemory, content_hash};
