//! Storage collaborators
//!
//! The tiering layer never owns memory records. It reads and writes them
//! through [`MemoryStore`] and keeps its own side-table of tier assignments
//! behind [`AssignmentStore`]. Both traits are implemented by the in-process
//! [`InMemoryStore`] and the LanceDB-backed [`LanceStore`].

pub mod filter;
pub mod lance;
pub mod memory;

pub use filter::RecordFilter;
pub use lance::LanceStore;
pub use memory::InMemoryStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::memory::types::{MemoryRecord, Tier, TierAssignment};

/// The external store that owns memory records
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Fetch a record, `None` when it does not exist
    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>>;

    /// Insert or replace a record
    async fn put(&self, record: &MemoryRecord) -> Result<()>;

    /// Records matching the filter, ordered by id
    ///
    /// Paging still orders the whole match set first. Callers walking every
    /// record should read once without a page and chunk the result.
    async fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>>;

    /// Remove a record. Returns true if something was deleted.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// The tier assignment side-table
///
/// Every write is a compare-and-swap on the row's `version`. A successful
/// write stores the row with version `expected.unwrap_or(0) + 1`.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn get_assignment(&self, memory_id: &str) -> Result<Option<TierAssignment>>;

    /// Write `assignment` if the stored row's version equals `expected`.
    ///
    /// `expected == None` means the row must not exist yet. Returns false when
    /// the check failed and nothing was written.
    async fn compare_and_swap(
        &self,
        assignment: &TierAssignment,
        expected: Option<u64>,
    ) -> Result<bool>;

    /// Delete an assignment. With `expected == None` the delete is
    /// unconditional; otherwise it only happens if the version still matches.
    async fn delete_assignment(&self, memory_id: &str, expected: Option<u64>) -> Result<bool>;

    /// One page of a tier, ordered by weight descending, then most recent
    /// access first, then id
    async fn list_by_tier(
        &self,
        tier: &Tier,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TierAssignment>>;

    /// Every row of a tier in `list_by_tier` order
    ///
    /// The default walks `list_by_tier` page by page. Stores that sort the
    /// tier on every page override it with a single read.
    async fn scan_tier(&self, tier: &Tier) -> Result<Vec<TierAssignment>> {
        let mut rows = Vec::new();
        loop {
            let page = self.list_by_tier(tier, SCAN_PAGE_SIZE, rows.len()).await?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < SCAN_PAGE_SIZE {
                return Ok(rows);
            }
        }
    }

    async fn count_by_tier(&self, tier: &Tier) -> Result<usize>;
}

/// Page size of the default [`AssignmentStore::scan_tier`]
const SCAN_PAGE_SIZE: usize = 1000;

/// Version a row carries after a successful compare-and-swap
pub fn next_version(expected: Option<u64>) -> u64 {
    expected.unwrap_or(0) + 1
}

/// Ordering shared by every `list_by_tier` implementation
pub(crate) fn tier_page_order(a: &TierAssignment, b: &TierAssignment) -> std::cmp::Ordering {
    b.weight
        .total_cmp(&a.weight)
        .then_with(|| b.last_accessed.cmp(&a.last_accessed))
        .then_with(|| a.memory_id.cmp(&b.memory_id))
}

/// Apply offset and limit to an already ordered list
pub(crate) fn paginate<T>(items: Vec<T>, limit: Option<usize>, offset: usize) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}
