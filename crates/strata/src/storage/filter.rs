//! Filter type for record queries
//!
//! Used by the synchronizer to read the external store and by the LanceDB
//! adapter to build its SQL predicate.

use chrono::{DateTime, Utc};

use crate::memory::types::MemoryRecord;

/// Filter criteria for [`MemoryStore::query`](super::MemoryStore::query).
///
/// All fields are optional - when `None`, that filter is not applied.
/// Multiple filters are combined with AND logic. Results are ordered by id so
/// `limit`/`offset` paging is stable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    /// Restrict to these ids
    pub ids: Option<Vec<String>>,
    /// Minimum weight (inclusive)
    pub min_weight: Option<f32>,
    /// Maximum weight (inclusive)
    pub max_weight: Option<f32>,
    /// Only records created at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Page size
    pub limit: Option<usize>,
    /// Rows to skip before the page starts
    pub offset: usize,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_min_weight(mut self, min_weight: f32) -> Self {
        self.min_weight = Some(min_weight);
        self
    }

    pub fn with_max_weight(mut self, max_weight: f32) -> Self {
        self.max_weight = Some(max_weight);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Select one page of results
    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    /// Whether a record satisfies the predicate part of the filter
    /// (paging is applied separately)
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.iter().any(|id| id == &record.id) {
                return false;
            }
        }
        if self.min_weight.is_some_and(|min| record.weight < min) {
            return false;
        }
        if self.max_weight.is_some_and(|max| record.weight > max) {
            return false;
        }
        if self.since.is_some_and(|since| record.created_at < since) {
            return false;
        }
        true
    }

    /// Build a SQL WHERE clause from the predicate part of this filter.
    /// Returns `None` if no predicate is set.
    pub fn to_sql_clause(&self) -> Option<String> {
        let mut conditions = Vec::new();

        if let Some(ref ids) = self.ids {
            if ids.is_empty() {
                conditions.push("false".to_string());
            } else {
                let in_clause = ids
                    .iter()
                    .map(|id| format!("'{}'", escape_sql(id)))
                    .collect::<Vec<_>>()
                    .join(", ");
                conditions.push(format!("id IN ({in_clause})"));
            }
        }

        if let Some(min_weight) = self.min_weight {
            conditions.push(format!("weight >= {min_weight}"));
        }

        if let Some(max_weight) = self.max_weight {
            conditions.push(format!("weight <= {max_weight}"));
        }

        // created_at is stored as microseconds since epoch
        if let Some(ref since) = self.since {
            let micros = since.timestamp_micros();
            conditions.push(format!("created_at >= {micros}"));
        }

        if conditions.is_empty() {
            None
        } else {
            Some(conditions.join(" AND "))
        }
    }

    /// Check if this filter has no predicate (paging ignored)
    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.min_weight.is_none()
            && self.max_weight.is_none()
            && self.since.is_none()
    }
}

/// Escape a string for use inside a single-quoted SQL literal
pub fn escape_sql(value: &str) -> String {
    value.replace('\'', "''")
}
