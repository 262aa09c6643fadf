//! Test utilities for strata - store fixtures and fault injection
//!
//! - [`FaultyStore`] wraps [`InMemoryStore`] and fails or loses
//!   compare-and-swaps on demand, for exercising degraded paths without a
//!   broken database
//! - `seed_*` helpers populate a store with records and assignments

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::ConfigManager;
use crate::error::{Result, StrataError};
use crate::memory::types::{MemoryRecord, Tier, TierAssignment};
use crate::service::TieringService;
use crate::storage::{AssignmentStore, InMemoryStore, MemoryStore, RecordFilter};

/// In-memory store whose record and assignment sides can be switched off
#[derive(Default)]
pub struct FaultyStore {
    inner: InMemoryStore,
    records_down: AtomicBool,
    record_writes_down: AtomicBool,
    assignments_down: AtomicBool,
    updates_lost: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// Make every `MemoryStore` call fail with `StoreUnavailable`
    pub fn fail_records(&self, down: bool) {
        self.records_down.store(down, Ordering::SeqCst);
    }

    /// Make every `AssignmentStore` call fail with `StoreUnavailable`
    pub fn fail_assignments(&self, down: bool) {
        self.assignments_down.store(down, Ordering::SeqCst);
    }

    /// Make `put` fail with `StoreUnavailable` while reads keep working
    pub fn fail_record_writes(&self, down: bool) {
        self.record_writes_down.store(down, Ordering::SeqCst);
    }

    /// Make every versioned update or delete of an existing row report a
    /// lost race, as if another writer always got there first
    pub fn lose_updates(&self, lost: bool) {
        self.updates_lost.store(lost, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, side: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StrataError::StoreUnavailable(format!("{side} offline")));
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for FaultyStore {
    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>> {
        Self::check(&self.records_down, "record store")?;
        self.inner.get(id).await
    }

    async fn put(&self, record: &MemoryRecord) -> Result<()> {
        Self::check(&self.records_down, "record store")?;
        Self::check(&self.record_writes_down, "record store writes")?;
        self.inner.put(record).await
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>> {
        Self::check(&self.records_down, "record store")?;
        self.inner.query(filter).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Self::check(&self.records_down, "record store")?;
        MemoryStore::delete(&self.inner, id).await
    }
}

#[async_trait]
impl AssignmentStore for FaultyStore {
    async fn get_assignment(&self, memory_id: &str) -> Result<Option<TierAssignment>> {
        Self::check(&self.assignments_down, "assignment store")?;
        self.inner.get_assignment(memory_id).await
    }

    async fn compare_and_swap(
        &self,
        assignment: &TierAssignment,
        expected: Option<u64>,
    ) -> Result<bool> {
        Self::check(&self.assignments_down, "assignment store")?;
        if expected.is_some() && self.updates_lost.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.compare_and_swap(assignment, expected).await
    }

    async fn delete_assignment(&self, memory_id: &str, expected: Option<u64>) -> Result<bool> {
        Self::check(&self.assignments_down, "assignment store")?;
        if expected.is_some() && self.updates_lost.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.delete_assignment(memory_id, expected).await
    }

    async fn list_by_tier(
        &self,
        tier: &Tier,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TierAssignment>> {
        Self::check(&self.assignments_down, "assignment store")?;
        self.inner.list_by_tier(tier, limit, offset).await
    }

    async fn scan_tier(&self, tier: &Tier) -> Result<Vec<TierAssignment>> {
        Self::check(&self.assignments_down, "assignment store")?;
        self.inner.scan_tier(tier).await
    }

    async fn count_by_tier(&self, tier: &Tier) -> Result<usize> {
        Self::check(&self.assignments_down, "assignment store")?;
        self.inner.count_by_tier(tier).await
    }
}

/// A service with default configuration over a fresh in-memory store
pub fn memory_service() -> (Arc<InMemoryStore>, TieringService) {
    let store = Arc::new(InMemoryStore::new());
    let service = TieringService::with_store(Arc::new(ConfigManager::default()), store.clone());
    (store, service)
}

/// Store a record and a matching assignment in `tier`
pub async fn seed_assigned<S>(store: &S, id: &str, tier: Tier, weight: f32) -> Result<TierAssignment>
where
    S: MemoryStore + AssignmentStore,
{
    store.put(&MemoryRecord::new(id, weight)).await?;
    let assignment = TierAssignment::new(id, tier, weight);
    store.compare_and_swap(&assignment, None).await?;
    Ok(TierAssignment {
        version: 1,
        ..assignment
    })
}

/// Store a record and assignment that were last touched at `last_accessed`
pub async fn seed_aged<S>(
    store: &S,
    id: &str,
    tier: Tier,
    weight: f32,
    last_accessed: DateTime<Utc>,
) -> Result<()>
where
    S: MemoryStore + AssignmentStore,
{
    let mut record = MemoryRecord::new(id, weight);
    record.created_at = last_accessed;
    record.last_accessed = last_accessed;
    store.put(&record).await?;

    let mut assignment = TierAssignment::new(id, tier, weight);
    assignment.created_at = last_accessed;
    assignment.last_accessed = last_accessed;
    store.compare_and_swap(&assignment, None).await?;
    Ok(())
}
