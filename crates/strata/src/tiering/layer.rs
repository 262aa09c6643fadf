//! Layer manager: weight classification and per-record tier assignments
//!
//! All writes go through the assignment store's compare-and-swap. The
//! request-path operations retry a lost race a few times with a fresh read;
//! the single-shot [`LayerManager::move_to_tier`] reports the conflict back to
//! the maintenance caller instead.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::{ConfigManager, TieringConfig};
use crate::error::{Result, StrataError};
use crate::memory::score::promotion_score;
use crate::memory::types::{AccessContext, Tier, TierAssignment, is_valid_weight};
use crate::storage::{AssignmentStore, next_version};

/// Attempts a request-path write makes before giving up with `Conflict`
const MAX_WRITE_ATTEMPTS: usize = 3;

pub struct LayerManager {
    config: Arc<ConfigManager>,
    store: Arc<dyn AssignmentStore>,
}

impl LayerManager {
    pub fn new(config: Arc<ConfigManager>, store: Arc<dyn AssignmentStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &Arc<ConfigManager> {
        &self.config
    }

    /// The tier a weight belongs to under the active configuration
    pub fn classify(&self, weight: f32) -> Result<Tier> {
        let config = self.config.snapshot();
        Ok(config.classify(weight)?.name.clone())
    }

    /// Create or overwrite the assignment of `memory_id` from its weight
    pub async fn assign_tier(&self, memory_id: &str, weight: f32) -> Result<TierAssignment> {
        let config = self.config.snapshot();
        let tier = config.classify(weight)?.name.clone();

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let now = Utc::now();
            let current = self.store.get_assignment(memory_id).await?;
            let expected = current.as_ref().map(|c| c.version);

            let mut assignment = match current {
                Some(existing) => TierAssignment {
                    tier: tier.clone(),
                    weight,
                    last_accessed: now,
                    ..existing
                },
                None => TierAssignment::new(memory_id, tier.clone(), weight),
            };
            assignment.promotion_score = score_in(&config, &assignment, now);

            if self.store.compare_and_swap(&assignment, expected).await? {
                assignment.version = next_version(expected);
                debug!(memory_id, tier = %tier, weight, "Assigned tier");
                return Ok(assignment);
            }
            debug!(memory_id, "Assignment changed concurrently, retrying");
        }

        Err(StrataError::Conflict(format!(
            "Could not assign tier to {memory_id}: concurrent writers"
        )))
    }

    /// Fetch an assignment, `NotFound` if the record was never assigned
    pub async fn get_assignment(&self, memory_id: &str) -> Result<TierAssignment> {
        self.store
            .get_assignment(memory_id)
            .await?
            .ok_or_else(|| StrataError::NotFound(format!("No tier assignment for {memory_id}")))
    }

    pub async fn find_assignment(&self, memory_id: &str) -> Result<Option<TierAssignment>> {
        self.store.get_assignment(memory_id).await
    }

    /// Return the existing assignment, or create one from `weight`
    ///
    /// A concurrent creator wins; its row is returned instead.
    pub async fn ensure_assignment(&self, memory_id: &str, weight: f32) -> Result<TierAssignment> {
        if let Some(existing) = self.store.get_assignment(memory_id).await? {
            return Ok(existing);
        }
        if let Some(created) = self.try_create(memory_id, weight).await? {
            return Ok(created);
        }
        self.get_assignment(memory_id).await
    }

    /// Create an assignment if none exists. `None` when another writer got
    /// there first.
    pub async fn try_create(&self, memory_id: &str, weight: f32) -> Result<Option<TierAssignment>> {
        let config = self.config.snapshot();
        let tier = config.classify(weight)?.name.clone();

        let mut assignment = TierAssignment::new(memory_id, tier, weight);
        assignment.promotion_score = score_in(&config, &assignment, assignment.last_accessed);

        if self.store.compare_and_swap(&assignment, None).await? {
            assignment.version = next_version(None);
            Ok(Some(assignment))
        } else {
            Ok(None)
        }
    }

    /// One page of a tier, weight descending then most recent access first
    pub async fn list_by_tier(
        &self,
        tier: &Tier,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TierAssignment>> {
        self.store.list_by_tier(tier, limit, offset).await
    }

    /// Every assignment in a tier, in `list_by_tier` order
    pub async fn scan_tier(&self, tier: &Tier) -> Result<Vec<TierAssignment>> {
        self.store.scan_tier(tier).await
    }

    pub async fn count_by_tier(&self, tier: &Tier) -> Result<usize> {
        self.store.count_by_tier(tier).await
    }

    /// Assignment counts for every configured tier, in ladder order
    pub async fn distribution(&self) -> Result<Vec<(Tier, usize)>> {
        let mut counts = Vec::new();
        for tier in self.config.snapshot().tier_order() {
            let count = self.store.count_by_tier(&tier).await?;
            counts.push((tier, count));
        }
        Ok(counts)
    }

    /// Record an access: bump the counter, refresh the timestamp and the
    /// promotion score. A missing assignment is created on the fly.
    pub async fn update_access(
        &self,
        memory_id: &str,
        context: &AccessContext,
    ) -> Result<TierAssignment> {
        let config = self.config.snapshot();

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let now = Utc::now();
            let current = self.store.get_assignment(memory_id).await?;
            let expected = current.as_ref().map(|c| c.version);

            let mut assignment = match current {
                Some(existing) => existing,
                None => {
                    let weight = lazy_weight(&config, memory_id, context);
                    let tier = config.classify(weight)?.name.clone();
                    TierAssignment::new(memory_id, tier, weight)
                }
            };
            assignment.access_count = assignment.access_count.saturating_add(1);
            assignment.last_accessed = now;
            assignment.promotion_score = score_in(&config, &assignment, now);

            if self.store.compare_and_swap(&assignment, expected).await? {
                assignment.version = next_version(expected);
                return Ok(assignment);
            }
        }

        Err(StrataError::Conflict(format!(
            "Could not record access to {memory_id}: concurrent writers"
        )))
    }

    /// Move one assignment to `target` with a single optimistic write.
    ///
    /// Returns `None` when the row changed since `current` was read.
    pub async fn move_to_tier(
        &self,
        current: &TierAssignment,
        target: &Tier,
        weight: f32,
    ) -> Result<Option<TierAssignment>> {
        let config = self.config.snapshot();
        let now = Utc::now();

        let mut moved = current.clone();
        moved.tier = target.clone();
        moved.weight = weight;
        moved.promotion_score = score_in(&config, &moved, now);

        let expected = Some(current.version);
        if self.store.compare_and_swap(&moved, expected).await? {
            moved.version = next_version(expected);
            debug!(
                memory_id = %current.memory_id,
                from = %current.tier,
                to = %target,
                "Moved assignment"
            );
            Ok(Some(moved))
        } else {
            Ok(None)
        }
    }

    /// Delete an assignment. `expected` guards against removing a row that
    /// changed since it was read.
    pub async fn remove(&self, memory_id: &str, expected: Option<u64>) -> Result<bool> {
        self.store.delete_assignment(memory_id, expected).await
    }
}

/// Promotion score of an assignment relative to its own tier, 0.0 when the
/// tier is no longer configured
pub(crate) fn score_in(config: &TieringConfig, assignment: &TierAssignment, now: DateTime<Utc>) -> f32 {
    config
        .tier(&assignment.tier)
        .map(|tier| promotion_score(assignment, tier, &config.scoring, now))
        .unwrap_or(0.0)
}

fn lazy_weight(config: &TieringConfig, memory_id: &str, context: &AccessContext) -> f32 {
    match context.weight {
        Some(weight) if is_valid_weight(weight) => weight,
        Some(weight) => {
            warn!(
                memory_id,
                weight, "Ignoring out-of-range access weight, using default"
            );
            config.system.default_weight
        }
        None => config.system.default_weight,
    }
}
