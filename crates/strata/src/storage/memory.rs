//! In-process store backed by `DashMap`
//!
//! Implements both collaborator traits. Compare-and-swap runs under the
//! shard lock of the key's entry, so writers to different ids never contend.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{
    AssignmentStore, MemoryStore, RecordFilter, next_version, paginate, tier_page_order,
};
use crate::error::Result;
use crate::memory::types::{MemoryRecord, Tier, TierAssignment};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<String, MemoryRecord>,
    assignments: DashMap<String, TierAssignment>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn put(&self, record: &MemoryRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>> {
        let mut matching: Vec<MemoryRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(paginate(matching, filter.limit, filter.offset))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.remove(id).is_some())
    }
}

#[async_trait]
impl AssignmentStore for InMemoryStore {
    async fn get_assignment(&self, memory_id: &str) -> Result<Option<TierAssignment>> {
        Ok(self.assignments.get(memory_id).map(|a| a.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        assignment: &TierAssignment,
        expected: Option<u64>,
    ) -> Result<bool> {
        let mut row = assignment.clone();
        row.version = next_version(expected);

        match self.assignments.entry(assignment.memory_id.clone()) {
            Entry::Occupied(mut entry) => {
                if expected != Some(entry.get().version) {
                    return Ok(false);
                }
                entry.insert(row);
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    return Ok(false);
                }
                entry.insert(row);
            }
        }
        Ok(true)
    }

    async fn delete_assignment(&self, memory_id: &str, expected: Option<u64>) -> Result<bool> {
        let removed = self
            .assignments
            .remove_if(memory_id, |_, row| expected.is_none_or(|v| row.version == v));
        Ok(removed.is_some())
    }

    async fn list_by_tier(
        &self,
        tier: &Tier,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TierAssignment>> {
        let rows = self.scan_tier(tier).await?;
        Ok(paginate(rows, Some(limit), offset))
    }

    async fn scan_tier(&self, tier: &Tier) -> Result<Vec<TierAssignment>> {
        let mut rows: Vec<TierAssignment> = self
            .assignments
            .iter()
            .filter(|a| &a.value().tier == tier)
            .map(|a| a.value().clone())
            .collect();
        rows.sort_by(tier_page_order);
        Ok(rows)
    }

    async fn count_by_tier(&self, tier: &Tier) -> Result<usize> {
        Ok(self
            .assignments
            .iter()
            .filter(|a| &a.value().tier == tier)
            .count())
    }
}
