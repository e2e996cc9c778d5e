//! Error types for Recall

use thiserror::Error;

/// Main error type for Recall operations
///
/// Variants carry rendered messages rather than source errors so the same
/// failure can be handed to every caller sharing a deduplicated query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecallError {
    /// Persistent store errors (unreachable, constraint failures, etc.)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Key-value tier errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Rejected input (bad identifiers, out-of-range pagination, etc.)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store's full-text search feature is not available
    #[error("Text search unavailable: {0}")]
    SearchUnavailable(String),

    /// The fetch a deduplicated query was waiting on went away without a result
    #[error("In-flight query abandoned: {0}")]
    QueryAbandoned(String),

    /// General errors
    #[error("{0}")]
    General(String),
}

impl From<serde_json::Error> for RecallError {
    fn from(e: serde_json::Error) -> Self {
        RecallError::Serialization(e.to_string())
    }
}

impl From<crate::memory::ids::IdError> for RecallError {
    fn from(e: crate::memory::ids::IdError) -> Self {
        RecallError::InvalidInput(e.to_string())
    }
}

/// Result type alias for Recall operations
pub type Result<T> = std::result::Result<T, RecallError>;
