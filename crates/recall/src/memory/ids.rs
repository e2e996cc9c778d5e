//! Validated identifiers for memory owners and categories
//!
//! Owner IDs and categories are embedded in cache keys and invalidation
//! patterns. They must be alphanumeric with underscores and hyphens so they
//! can never contain the key delimiter or glob metacharacters.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length for owner IDs
pub const MAX_OWNER_ID_LEN: usize = 128;

/// Maximum length for categories
pub const MAX_CATEGORY_LEN: usize = 64;

/// Errors that can occur during identifier validation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdError {
    /// Identifier is empty
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    /// Identifier contains invalid characters
    #[error("{0} contains invalid characters: allowed are a-z, A-Z, 0-9, _, -")]
    InvalidChars(&'static str),

    /// Identifier exceeds maximum length
    #[error("{0} exceeds maximum length of {1} characters")]
    TooLong(&'static str, usize),
}

fn validate(kind: &'static str, s: &str, max_len: usize) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty(kind));
    }

    if s.len() > max_len {
        return Err(IdError::TooLong(kind, max_len));
    }

    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(IdError::InvalidChars(kind));
    }

    Ok(())
}

/// A validated memory owner ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId(String);

impl OwnerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for OwnerId {
    type Error = IdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate("Owner ID", value, MAX_OWNER_ID_LEN)?;
        Ok(OwnerId(value.to_string()))
    }
}

impl TryFrom<String> for OwnerId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate("Owner ID", &value, MAX_OWNER_ID_LEN)?;
        Ok(OwnerId(value))
    }
}

impl From<OwnerId> for String {
    fn from(owner: OwnerId) -> Self {
        owner.0
    }
}

impl AsRef<str> for OwnerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated memory category (e.g. "note", "preference", "fact")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Category(String);

impl Category {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Category {
    type Error = IdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate("Category", value, MAX_CATEGORY_LEN)?;
        Ok(Category(value.to_string()))
    }
}

impl TryFrom<String> for Category {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate("Category", &value, MAX_CATEGORY_LEN)?;
        Ok(Category(value))
    }
}

impl From<Category> for String {
    fn from(category: Category) -> Self {
        category.0
    }
}

impl AsRef<str> for Category {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
