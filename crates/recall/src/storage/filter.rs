//! Typed query predicates for memory reads and deletes
//!
//! Queries are assembled from a closed set of predicates over an allow-list
//! of filterable fields. SQL rendering emits numbered placeholders with a
//! parallel parameter list, so no caller-supplied value is ever spliced into
//! the statement text.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{RecallError, Result};
use crate::memory::ids::{Category, OwnerId};
use crate::memory::types::MemoryRecord;

/// Default page size for reads
pub const DEFAULT_LIMIT: usize = 50;
/// Largest page a single read may request
pub const MAX_LIMIT: usize = 1000;
/// Deepest offset a paginated read may request
pub const MAX_OFFSET: usize = 100_000;
/// Maximum number of categories in one filter
pub const MAX_CATEGORIES: usize = 32;

/// Fields a predicate may constrain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilterField {
    OwnerId,
    Category,
    UpdatedAt,
    Importance,
}

impl FilterField {
    /// Column name in the `memories` relation
    pub fn column(&self) -> &'static str {
        match self {
            FilterField::OwnerId => "owner_id",
            FilterField::Category => "category",
            FilterField::UpdatedAt => "updated_at",
            FilterField::Importance => "importance",
        }
    }
}

/// A single condition on a memory record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Predicate {
    /// Owned by this owner
    OwnerEq(OwnerId),
    /// Category is one of these (OR logic within the list)
    CategoryIn(Vec<Category>),
    /// Updated at or after this time
    UpdatedSince(DateTime<Utc>),
    /// Updated strictly before this time
    UpdatedBefore(DateTime<Utc>),
    /// Importance strictly below this value
    ImportanceBelow(f32),
}

impl Predicate {
    pub fn field(&self) -> FilterField {
        match self {
            Predicate::OwnerEq(_) => FilterField::OwnerId,
            Predicate::CategoryIn(_) => FilterField::Category,
            Predicate::UpdatedSince(_) | Predicate::UpdatedBefore(_) => FilterField::UpdatedAt,
            Predicate::ImportanceBelow(_) => FilterField::Importance,
        }
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        match self {
            Predicate::OwnerEq(owner) => &record.owner_id == owner,
            Predicate::CategoryIn(categories) => categories.contains(&record.category),
            Predicate::UpdatedSince(since) => record.updated_at >= *since,
            Predicate::UpdatedBefore(before) => record.updated_at < *before,
            Predicate::ImportanceBelow(floor) => record.importance < *floor,
        }
    }
}

/// A bound statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    TextList(Vec<String>),
    Timestamp(DateTime<Utc>),
    Float(f32),
}

/// An owner-scoped, paginated memory query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryQuery {
    owner: OwnerId,
    predicates: Vec<Predicate>,
    limit: usize,
    offset: usize,
}

impl MemoryQuery {
    /// Create a query over every memory of `owner`
    pub fn for_owner(owner: OwnerId) -> Self {
        Self {
            predicates: vec![Predicate::OwnerEq(owner.clone())],
            owner,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }

    /// Restrict to these categories. An empty list adds no condition.
    pub fn with_categories(mut self, categories: Vec<Category>) -> Self {
        if !categories.is_empty() {
            self.predicates.push(Predicate::CategoryIn(categories));
        }
        self
    }

    /// Only memories updated at or after `since`
    pub fn updated_since(mut self, since: DateTime<Utc>) -> Self {
        self.predicates.push(Predicate::UpdatedSince(since));
        self
    }

    /// Only memories updated before `before`
    pub fn updated_before(mut self, before: DateTime<Utc>) -> Self {
        self.predicates.push(Predicate::UpdatedBefore(before));
        self
    }

    /// Only memories with importance below `floor`
    pub fn importance_below(mut self, floor: f32) -> Self {
        self.predicates.push(Predicate::ImportanceBelow(floor));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reject out-of-range pagination and malformed conditions
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 || self.limit > MAX_LIMIT {
            return Err(RecallError::InvalidInput(format!(
                "limit must be between 1 and {MAX_LIMIT}, got {}",
                self.limit
            )));
        }
        if self.offset > MAX_OFFSET {
            return Err(RecallError::InvalidInput(format!(
                "offset must be at most {MAX_OFFSET}, got {}",
                self.offset
            )));
        }

        for predicate in &self.predicates {
            match predicate {
                Predicate::CategoryIn(categories) if categories.len() > MAX_CATEGORIES => {
                    return Err(RecallError::InvalidInput(format!(
                        "at most {MAX_CATEGORIES} categories may be filtered, got {}",
                        categories.len()
                    )));
                }
                Predicate::ImportanceBelow(floor)
                    if !floor.is_finite() || !(0.0..=1.0).contains(floor) =>
                {
                    return Err(RecallError::InvalidInput(format!(
                        "importance threshold must be within [0, 1], got {floor}"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// True when every predicate holds for `record`
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }

    /// Apply this query's offset and limit to an ordered result set
    pub fn paginate(&self, records: Vec<MemoryRecord>) -> Vec<MemoryRecord> {
        records
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }

    /// Render the WHERE clause with numbered placeholders.
    ///
    /// Returns the clause text and its parameters in placeholder order.
    pub fn to_sql_clause(&self) -> (String, Vec<SqlParam>) {
        let mut conditions = Vec::with_capacity(self.predicates.len());
        let mut params = Vec::with_capacity(self.predicates.len());

        for predicate in &self.predicates {
            let column = predicate.field().column();
            let n = params.len() + 1;
            match predicate {
                Predicate::OwnerEq(owner) => {
                    conditions.push(format!("{column} = ${n}"));
                    params.push(SqlParam::Text(owner.to_string()));
                }
                Predicate::CategoryIn(categories) => {
                    conditions.push(format!("{column} = ANY(${n})"));
                    params.push(SqlParam::TextList(
                        categories.iter().map(|c| c.to_string()).collect(),
                    ));
                }
                Predicate::UpdatedSince(since) => {
                    conditions.push(format!("{column} >= ${n}"));
                    params.push(SqlParam::Timestamp(*since));
                }
                Predicate::UpdatedBefore(before) => {
                    conditions.push(format!("{column} < ${n}"));
                    params.push(SqlParam::Timestamp(*before));
                }
                Predicate::ImportanceBelow(floor) => {
                    conditions.push(format!("{column} < ${n}"));
                    params.push(SqlParam::Float(*floor));
                }
            }
        }

        (conditions.join(" AND "), params)
    }
}

/// Parse caller-supplied category names, rejecting any invalid one
pub fn parse_categories(categories: &[&str]) -> Result<Vec<Category>> {
    categories
        .iter()
        .map(|c| Category::try_from(*c).map_err(RecallError::from))
        .collect()
}
