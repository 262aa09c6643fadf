//! Weight-layer synchronizer
//!
//! Keeps the legacy importance weight on the record and the tier in the
//! assignment table in agreement. A record is drifted when it has no
//! assignment, or when its assignment's tier differs from the tier its weight
//! classifies into.
//!
//! Repairs are optimistic per record. A lost race is counted as a conflict
//! and left for the next cycle.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::layer::LayerManager;
use crate::config::{ConfigManager, SyncPolicy, TieringConfig};
use crate::error::{Result, StrataError};
use crate::maintenance::Interrupt;
use crate::memory::types::{MemoryRecord, Tier, TierAssignment};
use crate::storage::{MemoryStore, RecordFilter};

/// Shared slot holding the most recent consistency report
pub type ConsistencyHandle = Arc<RwLock<Option<ConsistencyReport>>>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub synced_count: usize,
    pub conflicts: usize,
    pub checked_count: usize,
    /// Drifted records left alone because demotion is disabled
    pub skipped_demotions: usize,
    /// Records whose stored weight is outside the accepted range
    pub invalid_weights: usize,
    /// Records skipped because the caller excluded them
    pub excluded: usize,
    pub interrupted: bool,
}

/// One record whose weight and tier disagree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inconsistency {
    pub memory_id: String,
    pub record_weight: f32,
    /// `None` when the record has no assignment at all
    pub assigned_tier: Option<Tier>,
    pub expected_tier: Tier,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub checked_at: DateTime<Utc>,
    pub checked_count: usize,
    pub inconsistent_count: usize,
    pub details: Vec<Inconsistency>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FixReport {
    pub fixed_count: usize,
    pub conflicts: usize,
    /// Reported records that had already been repaired or deleted
    pub already_consistent: usize,
}

/// What happened to one drifted record
enum Repair {
    Fixed,
    Conflict,
    SkippedDemotion,
}

pub struct Synchronizer {
    config: Arc<ConfigManager>,
    layers: Arc<LayerManager>,
    records: Arc<dyn MemoryStore>,
    last_report: ConsistencyHandle,
}

impl Synchronizer {
    pub fn new(
        config: Arc<ConfigManager>,
        layers: Arc<LayerManager>,
        records: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            config,
            layers,
            records,
            last_report: Arc::new(RwLock::new(None)),
        }
    }

    /// Handle the monitor reads sync status from
    pub fn consistency_handle(&self) -> ConsistencyHandle {
        self.last_report.clone()
    }

    pub fn last_report(&self) -> Option<ConsistencyReport> {
        self.last_report.read().clone()
    }

    pub async fn sync_all(&self) -> Result<SyncReport> {
        self.sync_all_with(&Interrupt::new()).await
    }

    /// Reconcile every record in the store
    ///
    /// The store is read once; records are then repaired in chunks of
    /// `maintenance_batch_size`, checking for an interrupt between chunks.
    /// Records still drifted afterwards (conflicts, skipped demotions) are
    /// cached as the latest consistency report.
    pub async fn sync_all_with(&self, interrupt: &Interrupt) -> Result<SyncReport> {
        self.sync_all_excluding(interrupt, &HashSet::new()).await
    }

    /// Like [`Synchronizer::sync_all_with`], leaving the ids in `excluded`
    /// untouched. Maintenance passes the records it just dropped so sync does
    /// not hand them a fresh assignment.
    pub async fn sync_all_excluding(
        &self,
        interrupt: &Interrupt,
        excluded: &HashSet<String>,
    ) -> Result<SyncReport> {
        let config = self.config.snapshot();
        let batch_size = config.system.maintenance_batch_size;
        let mut report = SyncReport::default();
        let mut leftover = Vec::new();

        if interrupt.is_triggered() {
            report.interrupted = true;
            return Ok(report);
        }
        let records = self.records.query(&RecordFilter::new()).await?;

        for (i, chunk) in records.chunks(batch_size).enumerate() {
            if i > 0 && interrupt.is_triggered() {
                report.interrupted = true;
                break;
            }

            for record in chunk {
                if excluded.contains(&record.id) {
                    report.excluded += 1;
                    continue;
                }
                report.checked_count += 1;
                let Some(drift) = self.detect(&config, record, &mut report.invalid_weights).await?
                else {
                    continue;
                };

                match self.repair(&config, record, &drift).await? {
                    Repair::Fixed => report.synced_count += 1,
                    Repair::Conflict => {
                        report.conflicts += 1;
                        leftover.push(drift);
                    }
                    Repair::SkippedDemotion => {
                        report.skipped_demotions += 1;
                        leftover.push(drift);
                    }
                }
            }
            tokio::task::yield_now().await;
        }

        if !report.interrupted {
            self.cache(report.checked_count, leftover);
        }

        info!(
            checked = report.checked_count,
            synced = report.synced_count,
            conflicts = report.conflicts,
            "Synchronization finished"
        );
        Ok(report)
    }

    /// Read-only scan listing every drifted record
    pub async fn verify_consistency(&self) -> Result<ConsistencyReport> {
        let config = self.config.snapshot();
        let batch_size = config.system.maintenance_batch_size;
        let mut details = Vec::new();
        let mut invalid = 0;

        let records = self.records.query(&RecordFilter::new()).await?;
        for chunk in records.chunks(batch_size) {
            for record in chunk {
                if let Some(drift) = self.detect(&config, record, &mut invalid).await? {
                    details.push(drift);
                }
            }
            tokio::task::yield_now().await;
        }
        let checked_count = records.len();

        if !details.is_empty() {
            warn!(inconsistent = details.len(), "Weight and tier have drifted");
        }
        Ok(self.cache(checked_count, details))
    }

    /// Repair the records listed in the last consistency report
    pub async fn fix_inconsistencies(&self) -> Result<FixReport> {
        let config = self.config.snapshot();
        let mut report = FixReport::default();

        let Some(previous) = self.last_report() else {
            debug!("No consistency report to fix");
            return Ok(report);
        };

        let mut remaining = Vec::new();
        for reported in &previous.details {
            let Some(record) = self.records.get(&reported.memory_id).await? else {
                report.already_consistent += 1;
                continue;
            };

            let mut invalid = 0;
            let Some(drift) = self.detect(&config, &record, &mut invalid).await? else {
                report.already_consistent += 1;
                continue;
            };

            match self.repair(&config, &record, &drift).await? {
                Repair::Fixed => report.fixed_count += 1,
                Repair::Conflict => {
                    report.conflicts += 1;
                    remaining.push(drift);
                }
                Repair::SkippedDemotion => remaining.push(drift),
            }
        }

        self.cache(previous.checked_count, remaining);
        info!(fixed = report.fixed_count, "Fixed inconsistencies");
        Ok(report)
    }

    /// Check a single record, `ConsistencyDrift` if it needs repair
    pub async fn check(&self, memory_id: &str) -> Result<()> {
        let config = self.config.snapshot();
        let record = self
            .records
            .get(memory_id)
            .await?
            .ok_or_else(|| StrataError::NotFound(format!("Memory not found: {memory_id}")))?;

        let mut invalid = 0;
        match self.detect(&config, &record, &mut invalid).await? {
            Some(drift) => Err(StrataError::ConsistencyDrift(format!(
                "{} has weight {} (expected tier {}) but is assigned to {}",
                drift.memory_id,
                drift.record_weight,
                drift.expected_tier,
                drift
                    .assigned_tier
                    .as_ref()
                    .map_or("nothing".to_string(), Tier::to_string)
            ))),
            None => Ok(()),
        }
    }

    fn cache(&self, checked_count: usize, details: Vec<Inconsistency>) -> ConsistencyReport {
        let report = ConsistencyReport {
            checked_at: Utc::now(),
            checked_count,
            inconsistent_count: details.len(),
            details,
        };
        *self.last_report.write() = Some(report.clone());
        report
    }

    async fn detect(
        &self,
        config: &TieringConfig,
        record: &MemoryRecord,
        invalid: &mut usize,
    ) -> Result<Option<Inconsistency>> {
        let expected_tier = match config.classify(record.weight) {
            Ok(tier) => tier.name.clone(),
            Err(StrataError::InvalidWeight(weight)) => {
                debug!(memory_id = %record.id, weight, "Skipping record with invalid weight");
                *invalid += 1;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let assigned_tier = self
            .layers
            .find_assignment(&record.id)
            .await?
            .map(|a| a.tier);

        if assigned_tier.as_ref() == Some(&expected_tier) {
            return Ok(None);
        }

        Ok(Some(Inconsistency {
            memory_id: record.id.clone(),
            record_weight: record.weight,
            assigned_tier,
            expected_tier,
        }))
    }

    async fn repair(
        &self,
        config: &TieringConfig,
        record: &MemoryRecord,
        drift: &Inconsistency,
    ) -> Result<Repair> {
        let Some(current) = self.layers.find_assignment(&record.id).await? else {
            return Ok(match self.layers.try_create(&record.id, record.weight).await? {
                Some(_) => Repair::Fixed,
                None => Repair::Conflict,
            });
        };

        let tier_known = config.tier(&current.tier).is_some();
        match config.sync.policy {
            SyncPolicy::TierWins if tier_known => self.clamp_weight(config, record, &current).await,
            _ => self.retier(config, record, &current, drift).await,
        }
    }

    /// Weight wins: move the assignment to the tier the weight classifies into
    async fn retier(
        &self,
        config: &TieringConfig,
        record: &MemoryRecord,
        current: &TierAssignment,
        drift: &Inconsistency,
    ) -> Result<Repair> {
        let is_demotion = match (config.rank(&current.tier), config.rank(&drift.expected_tier)) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        };
        if is_demotion && !config.sync.allow_demotion {
            debug!(memory_id = %record.id, "Demotion disabled, leaving drift in place");
            return Ok(Repair::SkippedDemotion);
        }

        match self
            .layers
            .move_to_tier(current, &drift.expected_tier, record.weight)
            .await?
        {
            Some(_) => {
                debug!(
                    memory_id = %record.id,
                    from = %current.tier,
                    to = %drift.expected_tier,
                    "Re-tiered from weight"
                );
                Ok(Repair::Fixed)
            }
            None => Ok(Repair::Conflict),
        }
    }

    /// Tier wins: clamp the record's weight into its assigned tier's band
    async fn clamp_weight(
        &self,
        config: &TieringConfig,
        record: &MemoryRecord,
        current: &TierAssignment,
    ) -> Result<Repair> {
        let Some(band) = config.tier(&current.tier) else {
            return Ok(Repair::Conflict);
        };
        let clamped = record.weight.clamp(band.min_weight, band.max_weight);

        // The record store has no versions; re-read and give up if the weight
        // moved under us.
        let Some(mut fresh) = self.records.get(&record.id).await? else {
            return Ok(Repair::Conflict);
        };
        if fresh.weight != record.weight {
            return Ok(Repair::Conflict);
        }

        fresh.weight = clamped;
        self.records.put(&fresh).await?;
        debug!(
            memory_id = %record.id,
            from = record.weight,
            to = clamped,
            tier = %current.tier,
            "Clamped weight into tier band"
        );
        Ok(Repair::Fixed)
    }
}
