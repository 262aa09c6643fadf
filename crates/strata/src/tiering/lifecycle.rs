//! Lifecycle manager: expiry, promotion and capacity balancing
//!
//! Each pass walks the ladder one tier at a time. A tier is read once, then
//! processed in chunks of `maintenance_batch_size` with a yield between
//! chunks. Every write is an optimistic single-record update, so a
//! pass stopped halfway leaves the completed records durably updated and the
//! rest untouched for the next run.
//!
//! Moves keep the record's legacy weight inside the destination band. The
//! assignment is moved first; the record weight is only written once that
//! compare-and-swap has won, so a conflicting move leaves both untouched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::layer::LayerManager;
use crate::config::{ConfigManager, TierConfig, TieringConfig};
use crate::error::Result;
use crate::maintenance::Interrupt;
use crate::memory::score::{is_past_retention, promotion_score, weakest_first};
use crate::memory::types::{Tier, TierAssignment};
use crate::storage::MemoryStore;

/// One record moved between tiers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierMove {
    pub memory_id: String,
    pub from: Tier,
    pub to: Tier,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub cleaned_count: usize,
    /// Records whose assignment was expired; the caller decides whether the
    /// records themselves are dropped
    pub expired_ids: Vec<String>,
    /// Tiers skipped because their cleanup interval has not elapsed
    pub tiers_not_due: Vec<Tier>,
    pub conflicts: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PromotionReport {
    pub promoted_count: usize,
    pub moves: Vec<TierMove>,
    pub conflicts: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BalanceReport {
    pub demoted_count: usize,
    pub evicted_count: usize,
    pub evicted_ids: Vec<String>,
    pub moves: Vec<TierMove>,
    /// Tiers still over capacity after the pass, with their excess
    pub overflow: Vec<(Tier, usize)>,
    pub conflicts: usize,
    pub interrupted: bool,
}

pub struct LifecycleManager {
    config: Arc<ConfigManager>,
    layers: Arc<LayerManager>,
    records: Arc<dyn MemoryStore>,
    last_cleanup: Mutex<HashMap<Tier, DateTime<Utc>>>,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<ConfigManager>,
        layers: Arc<LayerManager>,
        records: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            config,
            layers,
            records,
            last_cleanup: Mutex::new(HashMap::new()),
        }
    }

    pub async fn cleanup_expired(&self) -> Result<CleanupReport> {
        self.cleanup_expired_with(&Interrupt::new()).await
    }

    /// Expire assignments that outlived their tier's retention window and
    /// whose score no longer justifies keeping them
    pub async fn cleanup_expired_with(&self, interrupt: &Interrupt) -> Result<CleanupReport> {
        let config = self.config.snapshot();
        let batch_size = config.system.maintenance_batch_size;
        let mut report = CleanupReport::default();

        for tier in config.tiers.iter().filter(|t| t.auto_expire) {
            if interrupt.is_triggered() {
                report.interrupted = true;
                break;
            }

            let now = Utc::now();
            if !self.cleanup_due(tier, now) {
                debug!(tier = %tier.name, "Cleanup interval not elapsed, skipping tier");
                report.tiers_not_due.push(tier.name.clone());
                continue;
            }

            let rows = self.layers.scan_tier(&tier.name).await?;
            let mut completed = true;

            for (i, chunk) in rows.chunks(batch_size).enumerate() {
                if i > 0 && interrupt.is_triggered() {
                    report.interrupted = true;
                    completed = false;
                    break;
                }

                for row in chunk {
                    if !is_past_retention(row, tier, now) {
                        continue;
                    }
                    let score = promotion_score(row, tier, &config.scoring, now);
                    if score >= tier.promotion_threshold {
                        continue;
                    }

                    if self.layers.remove(&row.memory_id, Some(row.version)).await? {
                        debug!(memory_id = %row.memory_id, tier = %tier.name, score, "Expired assignment");
                        report.cleaned_count += 1;
                        report.expired_ids.push(row.memory_id.clone());
                    } else {
                        report.conflicts += 1;
                    }
                }
                tokio::task::yield_now().await;
            }

            if !completed {
                break;
            }
            self.last_cleanup.lock().insert(tier.name.clone(), now);
        }

        info!(
            cleaned = report.cleaned_count,
            conflicts = report.conflicts,
            "Cleanup pass finished"
        );
        Ok(report)
    }

    pub async fn promote_memories(&self) -> Result<PromotionReport> {
        self.promote_memories_with(&Interrupt::new()).await
    }

    /// Move records whose score exceeds their tier's threshold one tier up
    ///
    /// Tiers are processed from the top, and a record promoted in this pass is
    /// never looked at again, so nothing climbs two tiers at once.
    pub async fn promote_memories_with(&self, interrupt: &Interrupt) -> Result<PromotionReport> {
        let config = self.config.snapshot();
        let batch_size = config.system.maintenance_batch_size;
        let mut report = PromotionReport::default();
        let mut moved: HashSet<String> = HashSet::new();

        for pair in config.tiers.windows(2) {
            let (above, tier) = (&pair[0], &pair[1]);
            if interrupt.is_triggered() {
                report.interrupted = true;
                break;
            }

            let now = Utc::now();
            let rows = self.layers.scan_tier(&tier.name).await?;

            for (i, chunk) in rows.chunks(batch_size).enumerate() {
                if i > 0 && interrupt.is_triggered() {
                    report.interrupted = true;
                    break;
                }

                for row in chunk {
                    if moved.contains(&row.memory_id) {
                        continue;
                    }
                    let score = promotion_score(row, tier, &config.scoring, now);
                    if score <= tier.promotion_threshold {
                        continue;
                    }

                    let floor = above.min_weight;
                    if self
                        .move_with_weight(row, &above.name, |w| w.max(floor))
                        .await?
                    {
                        moved.insert(row.memory_id.clone());
                        report.promoted_count += 1;
                        report.moves.push(TierMove {
                            memory_id: row.memory_id.clone(),
                            from: tier.name.clone(),
                            to: above.name.clone(),
                            score,
                        });
                    } else {
                        report.conflicts += 1;
                    }
                }
                tokio::task::yield_now().await;
            }

            if report.interrupted {
                break;
            }
        }

        info!(
            promoted = report.promoted_count,
            conflicts = report.conflicts,
            "Promotion pass finished"
        );
        Ok(report)
    }

    pub async fn balance_layer_capacity(&self) -> Result<BalanceReport> {
        self.balance_layer_capacity_with(&Interrupt::new()).await
    }

    /// Bring every tier back under `max_records`
    ///
    /// The weakest excess records of an over-capacity tier move one tier
    /// down; the lowest tier evicts instead. Records that arrived in a tier
    /// during this pass are not moved again.
    pub async fn balance_layer_capacity_with(
        &self,
        interrupt: &Interrupt,
    ) -> Result<BalanceReport> {
        let config = self.config.snapshot();
        let batch_size = config.system.maintenance_batch_size;
        let mut report = BalanceReport::default();
        let mut moved: HashSet<String> = HashSet::new();

        for tier in &config.tiers {
            if interrupt.is_triggered() {
                report.interrupted = true;
                break;
            }

            let count = self.layers.count_by_tier(&tier.name).await?;
            if count <= tier.max_records {
                continue;
            }
            let excess = count - tier.max_records;
            debug!(tier = %tier.name, count, max = tier.max_records, "Tier over capacity");

            let now = Utc::now();
            let mut candidates: Vec<(TierAssignment, f32)> = self
                .layers
                .scan_tier(&tier.name)
                .await?
                .into_iter()
                .filter(|row| !moved.contains(&row.memory_id))
                .map(|row| {
                    let score = promotion_score(&row, tier, &config.scoring, now);
                    (row, score)
                })
                .collect();
            candidates.sort_by(weakest_first);
            candidates.truncate(excess);

            let below = config.tier_below(&tier.name);
            let mut removed = 0;

            for (i, chunk) in candidates.chunks(batch_size).enumerate() {
                if i > 0 && interrupt.is_triggered() {
                    report.interrupted = true;
                    break;
                }

                for (row, score) in chunk {
                    let done = match below {
                        Some(below) => self.demote(row, *score, tier, below, &mut report).await?,
                        None => self.evict(row, &mut report).await?,
                    };
                    if done {
                        moved.insert(row.memory_id.clone());
                        removed += 1;
                    } else {
                        report.conflicts += 1;
                    }
                }
                tokio::task::yield_now().await;
            }

            if removed < excess {
                warn!(
                    tier = %tier.name,
                    remaining = excess - removed,
                    "Tier still over capacity, retrying next cycle"
                );
                report.overflow.push((tier.name.clone(), excess - removed));
            }
            if report.interrupted {
                break;
            }
        }

        info!(
            demoted = report.demoted_count,
            evicted = report.evicted_count,
            "Capacity balancing finished"
        );
        Ok(report)
    }

    async fn demote(
        &self,
        row: &TierAssignment,
        score: f32,
        tier: &TierConfig,
        below: &TierConfig,
        report: &mut BalanceReport,
    ) -> Result<bool> {
        let ceiling = below.max_weight;
        if !self
            .move_with_weight(row, &below.name, |w| w.min(ceiling))
            .await?
        {
            return Ok(false);
        }
        report.demoted_count += 1;
        report.moves.push(TierMove {
            memory_id: row.memory_id.clone(),
            from: tier.name.clone(),
            to: below.name.clone(),
            score,
        });
        Ok(true)
    }

    async fn evict(&self, row: &TierAssignment, report: &mut BalanceReport) -> Result<bool> {
        if !self.layers.remove(&row.memory_id, Some(row.version)).await? {
            return Ok(false);
        }
        debug!(memory_id = %row.memory_id, tier = %row.tier, "Evicted assignment");
        report.evicted_count += 1;
        report.evicted_ids.push(row.memory_id.clone());
        Ok(true)
    }

    fn cleanup_due(&self, tier: &TierConfig, now: DateTime<Utc>) -> bool {
        if tier.cleanup_interval_hours == 0 {
            return true;
        }
        match self.last_cleanup.lock().get(&tier.name) {
            Some(last) => *last + Duration::hours(i64::from(tier.cleanup_interval_hours)) <= now,
            None => true,
        }
    }

    /// Move an assignment to `target` and bring the record's legacy weight
    /// along with it.
    ///
    /// Returns false when the move lost a compare-and-swap; nothing is written
    /// then. If the weight write fails after the move, the move is undone and
    /// the error returned. Orphaned assignments (no record in the store) only
    /// adjust their own snapshot.
    async fn move_with_weight<F>(
        &self,
        row: &TierAssignment,
        target: &Tier,
        adjust: F,
    ) -> Result<bool>
    where
        F: Fn(f32) -> f32,
    {
        let record = self.records.get(&row.memory_id).await?;
        let weight = match &record {
            Some(record) => adjust(record.weight),
            None => {
                debug!(
                    memory_id = %row.memory_id,
                    "No record behind assignment, adjusting snapshot only"
                );
                adjust(row.weight)
            }
        };

        let Some(moved) = self.layers.move_to_tier(row, target, weight).await? else {
            return Ok(false);
        };

        let Some(mut record) = record else {
            return Ok(true);
        };
        if record.weight == weight {
            return Ok(true);
        }

        record.weight = weight;
        if let Err(e) = self.records.put(&record).await {
            let memory_id = &row.memory_id;
            match self.layers.move_to_tier(&moved, &row.tier, row.weight).await {
                Ok(Some(_)) => debug!(%memory_id, "Reverted move after failed weight write"),
                Ok(None) => warn!(%memory_id, "Could not revert move, assignment changed"),
                Err(revert) => warn!(%memory_id, error = %revert, "Could not revert move"),
            }
            return Err(e);
        }
        Ok(true)
    }
}

/// Promotion score of every assignment in `rows` relative to `tier`
pub fn score_rows(
    config: &TieringConfig,
    tier: &TierConfig,
    rows: &[TierAssignment],
    now: DateTime<Utc>,
) -> Vec<f32> {
    rows.iter()
        .map(|row| promotion_score(row, tier, &config.scoring, now))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::MemoryRecord;
    use crate::storage::{AssignmentStore, InMemoryStore};
    use crate::testing::FaultyStore;

    struct Fixture {
        store: Arc<InMemoryStore>,
        config: Arc<ConfigManager>,
        layers: Arc<LayerManager>,
        lifecycle: LifecycleManager,
    }

    fn fixture(config: TieringConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let config = Arc::new(ConfigManager::new(config).unwrap());
        let layers = Arc::new(LayerManager::new(config.clone(), store.clone()));
        let lifecycle = LifecycleManager::new(config.clone(), layers.clone(), store.clone());
        Fixture {
            store,
            config,
            layers,
            lifecycle,
        }
    }

    /// Lifecycle manager over a store whose writes can be made to fail or lose
    fn faulty(config: TieringConfig) -> (Arc<FaultyStore>, Arc<LayerManager>, LifecycleManager) {
        let store = Arc::new(FaultyStore::new());
        let config = Arc::new(ConfigManager::new(config).unwrap());
        let layers = Arc::new(LayerManager::new(config.clone(), store.clone()));
        let lifecycle = LifecycleManager::new(config, layers.clone(), store.clone());
        (store, layers, lifecycle)
    }

    async fn seed(
        store: &InMemoryStore,
        id: &str,
        tier: Tier,
        weight: f32,
        access_count: u32,
        idle_days: i64,
    ) {
        let mut record = MemoryRecord::new(id, weight);
        record.access_count = access_count;
        store.put(&record).await.unwrap();

        let mut assignment = TierAssignment::new(id, tier, weight);
        assignment.access_count = access_count;
        assignment.last_accessed = Utc::now() - Duration::days(idle_days);
        store.compare_and_swap(&assignment, None).await.unwrap();
    }

    mod cleanup {
        use super::*;

        #[tokio::test]
        async fn test_expires_idle_low_score_records() {
            let f = fixture(TieringConfig::default());
            seed(&f.store, "stale", Tier::short_term(), 1.5, 0, 30).await;
            seed(&f.store, "fresh", Tier::short_term(), 1.5, 0, 1).await;

            let report = f.lifecycle.cleanup_expired().await.unwrap();
            assert_eq!(report.cleaned_count, 1);
            assert_eq!(report.expired_ids, vec!["stale".to_string()]);
            assert!(f.layers.find_assignment("stale").await.unwrap().is_none());
            assert!(f.layers.find_assignment("fresh").await.unwrap().is_some());
            // Only the assignment goes; the record stays
            assert!(f.store.get("stale").await.unwrap().is_some());
        }

        #[tokio::test]
        async fn test_lost_expiry_keeps_assignment_until_next_run() {
            let (store, layers, lifecycle) = faulty(TieringConfig::default());
            seed(store.inner(), "stale", Tier::short_term(), 1.5, 0, 30).await;
            store.lose_updates(true);

            let report = lifecycle.cleanup_expired().await.unwrap();
            assert_eq!(report.conflicts, 1);
            assert_eq!(report.cleaned_count, 0);
            assert!(report.expired_ids.is_empty());
            assert!(layers.find_assignment("stale").await.unwrap().is_some());

            // The tier counts as cleaned; a fresh manager is due again
            store.lose_updates(false);
            let retry = LifecycleManager::new(
                Arc::new(ConfigManager::default()),
                layers.clone(),
                store.clone(),
            );
            let report = retry.cleanup_expired().await.unwrap();
            assert_eq!(report.expired_ids, vec!["stale".to_string()]);
        }

        #[tokio::test]
        async fn test_high_score_protects_idle_record() {
            let mut config = TieringConfig::default();
            config.tiers[3].promotion_threshold = 0.3;
            let f = fixture(config);
            // Heavily used and at the top of its band: score ~0.7 even when idle
            seed(&f.store, "popular", Tier::short_term(), 3.9, 100, 30).await;

            let report = f.lifecycle.cleanup_expired().await.unwrap();
            assert_eq!(report.cleaned_count, 0);
        }

        #[tokio::test]
        async fn test_core_never_expires() {
            let f = fixture(TieringConfig::default());
            seed(&f.store, "ancient", Tier::core(), 9.0, 0, 5_000).await;

            let report = f.lifecycle.cleanup_expired().await.unwrap();
            assert_eq!(report.cleaned_count, 0);
            assert!(f.layers.find_assignment("ancient").await.unwrap().is_some());
        }

        #[tokio::test]
        async fn test_cleanup_interval_is_honored() {
            let f = fixture(TieringConfig::default());
            seed(&f.store, "stale-1", Tier::short_term(), 1.5, 0, 30).await;

            let first = f.lifecycle.cleanup_expired().await.unwrap();
            assert_eq!(first.cleaned_count, 1);

            seed(&f.store, "stale-2", Tier::short_term(), 1.5, 0, 30).await;
            let second = f.lifecycle.cleanup_expired().await.unwrap();
            assert_eq!(second.cleaned_count, 0);
            assert!(second.tiers_not_due.contains(&Tier::short_term()));
        }

        #[tokio::test]
        async fn test_interrupt_stops_before_first_tier() {
            let f = fixture(TieringConfig::default());
            seed(&f.store, "stale", Tier::short_term(), 1.5, 0, 30).await;

            let interrupt = Interrupt::new();
            interrupt.trigger();
            let report = f.lifecycle.cleanup_expired_with(&interrupt).await.unwrap();
            assert!(report.interrupted);
            assert_eq!(report.cleaned_count, 0);

            // The tier was not marked as cleaned, so the next run handles it
            let report = f.lifecycle.cleanup_expired().await.unwrap();
            assert_eq!(report.cleaned_count, 1);
        }
    }

    mod promotion {
        use super::*;

        #[tokio::test]
        async fn test_promotes_one_tier_and_raises_weight() {
            let f = fixture(TieringConfig::default());
            seed(&f.store, "hot", Tier::archive(), 8.5, 50, 0).await;
            seed(&f.store, "cold", Tier::archive(), 7.1, 0, 170).await;

            let report = f.lifecycle.promote_memories().await.unwrap();
            assert_eq!(report.promoted_count, 1);
            assert_eq!(report.moves[0].memory_id, "hot");
            assert_eq!(report.moves[0].to, Tier::core());

            let assignment = f.layers.get_assignment("hot").await.unwrap();
            assert_eq!(assignment.tier, Tier::core());
            let record = f.store.get("hot").await.unwrap().unwrap();
            assert_eq!(record.weight, 9.0);
            assert_eq!(assignment.weight, 9.0);

            assert_eq!(
                f.layers.get_assignment("cold").await.unwrap().tier,
                Tier::archive()
            );
        }

        #[tokio::test]
        async fn test_never_moves_two_tiers_in_one_pass() {
            let mut config = TieringConfig::default();
            for tier in &mut config.tiers {
                tier.promotion_threshold = 0.0;
            }
            let f = fixture(config);
            seed(&f.store, "climber", Tier::short_term(), 3.9, 100, 0).await;

            let report = f.lifecycle.promote_memories().await.unwrap();
            assert_eq!(report.promoted_count, 1);
            assert_eq!(
                f.layers.get_assignment("climber").await.unwrap().tier,
                Tier::long_term()
            );

            f.lifecycle.promote_memories().await.unwrap();
            assert_eq!(
                f.layers.get_assignment("climber").await.unwrap().tier,
                Tier::archive()
            );
        }

        #[tokio::test]
        async fn test_lost_promotion_leaves_weight_and_tier() {
            let (store, layers, lifecycle) = faulty(TieringConfig::default());
            seed(store.inner(), "hot", Tier::archive(), 8.5, 100, 0).await;
            store.lose_updates(true);

            let report = lifecycle.promote_memories().await.unwrap();
            assert_eq!(report.promoted_count, 0);
            assert_eq!(report.conflicts, 1);
            assert!(report.moves.is_empty());
            assert_eq!(store.get("hot").await.unwrap().unwrap().weight, 8.5);
            let assignment = layers.get_assignment("hot").await.unwrap();
            assert_eq!(assignment.tier, Tier::archive());
            assert_eq!(assignment.version, 1);

            store.lose_updates(false);
            let report = lifecycle.promote_memories().await.unwrap();
            assert_eq!(report.promoted_count, 1);
            assert_eq!(report.conflicts, 0);
            assert_eq!(store.get("hot").await.unwrap().unwrap().weight, 9.0);
            assert_eq!(layers.get_assignment("hot").await.unwrap().tier, Tier::core());
        }

        #[tokio::test]
        async fn test_failed_weight_write_reverts_promotion() {
            let (store, layers, lifecycle) = faulty(TieringConfig::default());
            seed(store.inner(), "hot", Tier::archive(), 8.5, 100, 0).await;
            store.fail_record_writes(true);

            let err = lifecycle.promote_memories().await.unwrap_err();
            assert!(err.is_transient());
            assert_eq!(store.get("hot").await.unwrap().unwrap().weight, 8.5);
            let assignment = layers.get_assignment("hot").await.unwrap();
            assert_eq!(assignment.tier, Tier::archive());
            assert_eq!(assignment.weight, 8.5);

            store.fail_record_writes(false);
            let report = lifecycle.promote_memories().await.unwrap();
            assert_eq!(report.promoted_count, 1);
            assert_eq!(store.get("hot").await.unwrap().unwrap().weight, 9.0);
        }

        #[tokio::test]
        async fn test_orphaned_assignment_is_promoted() {
            let f = fixture(TieringConfig::default());
            let mut assignment = TierAssignment::new("orphan", Tier::long_term(), 6.5);
            assignment.access_count = 100;
            f.store.compare_and_swap(&assignment, None).await.unwrap();

            let report = f.lifecycle.promote_memories().await.unwrap();
            assert_eq!(report.promoted_count, 1);
            let moved = f.layers.get_assignment("orphan").await.unwrap();
            assert_eq!(moved.tier, Tier::archive());
            assert_eq!(moved.weight, 7.0);
        }
    }

    mod balance {
        use super::*;

        #[tokio::test]
        async fn test_lowest_tier_evicts_weakest() {
            let mut config = TieringConfig::default();
            config.tiers[3].max_records = 2;
            let f = fixture(config);

            // Scores roughly 0.9, 0.5 and 0.1
            seed(&f.store, "strong", Tier::short_term(), 3.9, 40, 0).await;
            seed(&f.store, "middle", Tier::short_term(), 2.5, 3, 2).await;
            seed(&f.store, "weak", Tier::short_term(), 1.5, 0, 6).await;

            let snapshot = f.config.snapshot();
            let tier = snapshot.tier(&Tier::short_term()).unwrap();
            let rows = f.layers.list_by_tier(&Tier::short_term(), 10, 0).await.unwrap();
            let scores = score_rows(&snapshot, tier, &rows, Utc::now());
            let weakest = rows
                .iter()
                .zip(&scores)
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(row, _)| row.memory_id.clone())
                .unwrap();
            assert_eq!(weakest, "weak");

            let report = f.lifecycle.balance_layer_capacity().await.unwrap();
            assert_eq!(report.evicted_count, 1);
            assert_eq!(report.evicted_ids, vec!["weak".to_string()]);
            assert_eq!(f.layers.count_by_tier(&Tier::short_term()).await.unwrap(), 2);
        }

        #[tokio::test]
        async fn test_demotes_excess_and_lowers_weight() {
            let mut config = TieringConfig::default();
            config.tiers[1].max_records = 1;
            let f = fixture(config);
            seed(&f.store, "keep", Tier::archive(), 8.8, 20, 0).await;
            seed(&f.store, "drop", Tier::archive(), 7.2, 0, 90).await;

            let report = f.lifecycle.balance_layer_capacity().await.unwrap();
            assert_eq!(report.demoted_count, 1);
            assert_eq!(report.moves[0].memory_id, "drop");
            assert_eq!(report.moves[0].to, Tier::long_term());

            let record = f.store.get("drop").await.unwrap().unwrap();
            assert_eq!(record.weight, 6.9);
            assert_eq!(f.layers.count_by_tier(&Tier::archive()).await.unwrap(), 1);
        }

        #[tokio::test]
        async fn test_lost_demotion_reports_overflow_and_keeps_weight() {
            let mut config = TieringConfig::default();
            config.tiers[1].max_records = 1;
            let (store, layers, lifecycle) = faulty(config);
            seed(store.inner(), "keep", Tier::archive(), 8.8, 20, 0).await;
            seed(store.inner(), "drop", Tier::archive(), 7.2, 0, 90).await;
            store.lose_updates(true);

            let report = lifecycle.balance_layer_capacity().await.unwrap();
            assert_eq!(report.demoted_count, 0);
            assert_eq!(report.conflicts, 1);
            assert_eq!(report.overflow, vec![(Tier::archive(), 1)]);
            assert_eq!(store.get("drop").await.unwrap().unwrap().weight, 7.2);
            assert_eq!(
                layers.get_assignment("drop").await.unwrap().tier,
                Tier::archive()
            );

            store.lose_updates(false);
            let report = lifecycle.balance_layer_capacity().await.unwrap();
            assert_eq!(report.demoted_count, 1);
            assert!(report.overflow.is_empty());
            assert_eq!(store.get("drop").await.unwrap().unwrap().weight, 6.9);
        }

        #[tokio::test]
        async fn test_lost_eviction_is_retried() {
            let mut config = TieringConfig::default();
            config.tiers[3].max_records = 1;
            let (store, layers, lifecycle) = faulty(config);
            seed(store.inner(), "strong", Tier::short_term(), 3.9, 40, 0).await;
            seed(store.inner(), "weak", Tier::short_term(), 1.5, 0, 6).await;
            store.lose_updates(true);

            let report = lifecycle.balance_layer_capacity().await.unwrap();
            assert_eq!(report.evicted_count, 0);
            assert_eq!(report.conflicts, 1);
            assert!(layers.find_assignment("weak").await.unwrap().is_some());

            store.lose_updates(false);
            let report = lifecycle.balance_layer_capacity().await.unwrap();
            assert_eq!(report.evicted_ids, vec!["weak".to_string()]);
        }

        #[tokio::test]
        async fn test_every_tier_within_capacity_after_balance() {
            let mut config = TieringConfig::default();
            let maxima = [2, 3, 3, 4];
            for (tier, max) in config.tiers.iter_mut().zip(maxima) {
                tier.max_records = max;
            }
            let f = fixture(config);

            for i in 0..4 {
                seed(&f.store, &format!("core-{i}"), Tier::core(), 9.5, i, 0).await;
            }
            for i in 0..3 {
                seed(&f.store, &format!("archive-{i}"), Tier::archive(), 8.0, i, 0).await;
            }
            for i in 0..2 {
                seed(&f.store, &format!("long-{i}"), Tier::long_term(), 5.0, i, 0).await;
            }
            seed(&f.store, "short-0", Tier::short_term(), 2.0, 0, 0).await;

            let report = f.lifecycle.balance_layer_capacity().await.unwrap();
            assert!(report.overflow.is_empty());

            let snapshot = f.config.snapshot();
            for tier in &snapshot.tiers {
                let count = f.layers.count_by_tier(&tier.name).await.unwrap();
                assert!(count <= tier.max_records, "{} holds {count}", tier.name);
            }
        }

        #[tokio::test]
        async fn test_within_capacity_is_untouched() {
            let f = fixture(TieringConfig::default());
            seed(&f.store, "a", Tier::long_term(), 5.0, 0, 0).await;

            let report = f.lifecycle.balance_layer_capacity().await.unwrap();
            assert_eq!(report.demoted_count + report.evicted_count, 0);
        }
    }
}
