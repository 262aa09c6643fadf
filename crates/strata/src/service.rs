//! Integration facade for the surrounding pipeline
//!
//! Storage and retrieval hooks never fail the caller: if tiering is
//! unavailable they hand back the input unchanged and log a warning.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConfigManager;
use crate::error::{Result, StrataError};
use crate::maintenance::{Interrupt, MaintenanceReport, StageOutcome};
use crate::memory::types::{AccessContext, MemoryRecord, Tier};
use crate::storage::{AssignmentStore, MemoryStore};
use crate::tiering::{
    CapacityAlert, LayerManager, LifecycleManager, Monitor, QueryContext, RankedCandidate,
    RetrievalEnhancer, SyncReport, Synchronizer, SystemMetrics,
};

/// Records of one tier inside a built context
#[derive(Debug, Clone, Serialize)]
pub struct TierGroup {
    pub tier: Tier,
    pub records: Vec<MemoryRecord>,
}

/// Records reshaped by tier for prompt construction
#[derive(Debug, Clone, Serialize)]
pub struct TieredContext {
    pub query: String,
    /// Non-empty groups, in ladder order
    pub groups: Vec<TierGroup>,
    /// Record count per tier, every configured tier included
    pub distribution: BTreeMap<Tier, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub metrics: SystemMetrics,
    pub alerts: Vec<CapacityAlert>,
}

pub struct TieringService {
    config: Arc<ConfigManager>,
    records: Arc<dyn MemoryStore>,
    layers: Arc<LayerManager>,
    lifecycle: LifecycleManager,
    sync: Synchronizer,
    retrieval: RetrievalEnhancer,
    monitor: Arc<Monitor>,
}

impl TieringService {
    pub fn new(
        config: Arc<ConfigManager>,
        records: Arc<dyn MemoryStore>,
        assignments: Arc<dyn AssignmentStore>,
    ) -> Self {
        let layers = Arc::new(LayerManager::new(config.clone(), assignments));
        let lifecycle = LifecycleManager::new(config.clone(), layers.clone(), records.clone());
        let sync = Synchronizer::new(config.clone(), layers.clone(), records.clone());
        let retrieval = RetrievalEnhancer::new(config.clone(), layers.clone(), records.clone());
        let monitor = Arc::new(Monitor::new(
            config.clone(),
            layers.clone(),
            sync.consistency_handle(),
        ));

        Self {
            config,
            records,
            layers,
            lifecycle,
            sync,
            retrieval,
            monitor,
        }
    }

    /// Build a service over a single store implementing both traits
    pub fn with_store<S>(config: Arc<ConfigManager>, store: Arc<S>) -> Self
    where
        S: MemoryStore + AssignmentStore + 'static,
    {
        Self::new(config, store.clone(), store)
    }

    pub fn config(&self) -> &Arc<ConfigManager> {
        &self.config
    }

    pub fn layers(&self) -> &Arc<LayerManager> {
        &self.layers
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }

    pub fn retrieval(&self) -> &RetrievalEnhancer {
        &self.retrieval
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Assign a tier to a record on its way into storage and annotate it
    pub async fn enhance_storage(&self, record: MemoryRecord) -> MemoryRecord {
        let started = Instant::now();
        let result = self.layers.assign_tier(&record.id, record.weight).await;
        self.monitor
            .record_latency("enhance_storage", started.elapsed());

        match result {
            Ok(assignment) => MemoryRecord {
                tier: Some(assignment.tier),
                ..record
            },
            Err(e) => {
                warn!(memory_id = %record.id, error = %e, "Tier assignment failed, storing record unenhanced");
                record
            }
        }
    }

    /// Re-rank retrieval candidates by tier, falling back to the upstream
    /// order when tiering is unavailable
    pub async fn enhance_retrieval(
        &self,
        ids: &[String],
        context: &QueryContext,
    ) -> Vec<RankedCandidate> {
        let started = Instant::now();
        let result = self.retrieval.enhance_retrieval(ids, context).await;
        self.monitor
            .record_latency("enhance_retrieval", started.elapsed());

        match result {
            Ok(ranked) => ranked,
            Err(e) => {
                warn!(error = %e, "Retrieval enhancement failed, keeping upstream order");
                pass_through(ids, context)
            }
        }
    }

    /// Keep the candidates whose tier is in `allowed`, in their original
    /// order. When tiering is unavailable every candidate is kept.
    pub async fn filter_by_tier(&self, ids: &[String], allowed: &[Tier]) -> Vec<String> {
        match self.retrieval.filter_by_tier(ids, allowed).await {
            Ok(kept) => kept,
            Err(e) => {
                warn!(error = %e, "Tier filter failed, keeping every candidate");
                ids.to_vec()
            }
        }
    }

    /// Candidates routed for `query_kind`: only those in the kind's preferred
    /// tiers, in their original order
    pub async fn route_candidates(&self, ids: &[String], query_kind: &str) -> Vec<String> {
        let allowed = self.retrieval.smart_tier_selection(query_kind);
        self.filter_by_tier(ids, &allowed).await
    }

    /// Group records by tier for context building
    pub fn enhance_context_building(
        &self,
        query: &str,
        records: Vec<MemoryRecord>,
    ) -> Result<TieredContext> {
        if query.trim().is_empty() {
            return Err(StrataError::InvalidInput(
                "Context query must not be empty".to_string(),
            ));
        }

        let config = self.config.snapshot();
        let lowest = config
            .lowest_tier()
            .map(|t| t.name.clone())
            .ok_or_else(|| StrataError::ConfigInvalid("No tiers configured".to_string()))?;

        let mut grouped: BTreeMap<Tier, Vec<MemoryRecord>> = BTreeMap::new();
        for record in records {
            let tier = match &record.tier {
                Some(tier) if config.tier(tier).is_some() => tier.clone(),
                _ => config
                    .classify(record.weight)
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|_| lowest.clone()),
            };
            grouped.entry(tier).or_default().push(record);
        }

        let mut groups = Vec::new();
        let mut distribution = BTreeMap::new();
        for tier in config.tier_order() {
            let records = grouped.remove(&tier).unwrap_or_default();
            distribution.insert(tier.clone(), records.len());
            if !records.is_empty() {
                groups.push(TierGroup { tier, records });
            }
        }

        Ok(TieredContext {
            query: query.to_string(),
            groups,
            distribution,
        })
    }

    /// Record an access in the background; callers never wait on it
    ///
    /// Must be called from within a Tokio runtime.
    pub fn update_access(&self, memory_id: &str, context: AccessContext) -> JoinHandle<()> {
        let layers = self.layers.clone();
        let memory_id = memory_id.to_string();

        tokio::spawn(async move {
            if let Err(e) = layers.update_access(&memory_id, &context).await {
                warn!(memory_id = %memory_id, error = %e, "Failed to record access");
            }
        })
    }

    /// Delete a record and its assignment
    pub async fn forget(&self, memory_id: &str) -> Result<bool> {
        let record_deleted = self.records.delete(memory_id).await?;
        let assignment_deleted = self.layers.remove(memory_id, None).await?;
        debug!(memory_id, record_deleted, assignment_deleted, "Forgot memory");
        Ok(record_deleted || assignment_deleted)
    }

    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.run_maintenance_with(&Interrupt::new()).await
    }

    /// Run one maintenance cycle: cleanup, promotion, balancing, sync and a
    /// metrics snapshot, in that order. A failed stage does not stop the
    /// stages after it. Records dropped by cleanup or balancing are purged
    /// between balancing and sync.
    pub async fn run_maintenance_with(&self, interrupt: &Interrupt) -> MaintenanceReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let system = self.config.system();
        info!(%run_id, "Starting maintenance cycle");

        let cleanup = if interrupt.is_triggered() {
            StageOutcome::skipped("interrupted")
        } else {
            stage("cleanup", self.lifecycle.cleanup_expired_with(interrupt).await)
        };

        let promotion = if interrupt.is_triggered() {
            StageOutcome::skipped("interrupted")
        } else {
            stage("promotion", self.lifecycle.promote_memories_with(interrupt).await)
        };

        let balance = if interrupt.is_triggered() {
            StageOutcome::skipped("interrupted")
        } else {
            stage(
                "balance",
                self.lifecycle.balance_layer_capacity_with(interrupt).await,
            )
        };

        // Dropped records leave the record store before sync runs, and sync
        // skips them either way so it cannot re-assign them this cycle.
        let mut dropped: HashSet<String> = HashSet::new();
        if let Some(report) = cleanup.completed() {
            dropped.extend(report.expired_ids.iter().cloned());
        }
        if let Some(report) = balance.completed() {
            dropped.extend(report.evicted_ids.iter().cloned());
        }
        let purged_records = if system.purge_dropped_records {
            self.purge(&dropped).await
        } else {
            0
        };

        let sync = if !system.auto_sync_enabled {
            StageOutcome::skipped("auto sync disabled")
        } else if interrupt.is_triggered() {
            StageOutcome::skipped("interrupted")
        } else {
            stage("sync", self.sync.sync_all_excluding(interrupt, &dropped).await)
        };

        let snapshot = stage("snapshot", self.monitor.get_system_metrics().await);

        self.monitor.record_latency("run_maintenance", started.elapsed());
        let report = MaintenanceReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cleanup,
            promotion,
            balance,
            sync,
            snapshot,
            purged_records,
            interrupted: interrupt.is_triggered(),
        };

        info!(
            %run_id,
            failures = report.has_failures(),
            purged = purged_records,
            interrupted = report.interrupted,
            "Maintenance cycle finished"
        );
        report
    }

    /// Standalone synchronization run for the sync timer
    pub async fn run_sync(&self, interrupt: &Interrupt) -> Result<SyncReport> {
        self.sync.sync_all_with(interrupt).await
    }

    /// Current metrics plus capacity alerts
    pub async fn get_system_status(&self) -> Result<SystemStatus> {
        let metrics = self.monitor.get_system_metrics().await?;
        let alerts = self.monitor.alerts_for(&metrics);
        Ok(SystemStatus { metrics, alerts })
    }

    async fn purge(&self, ids: &HashSet<String>) -> usize {
        let mut purged = 0;
        for id in ids {
            match self.records.delete(id).await {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(e) => warn!(memory_id = %id, error = %e, "Failed to purge dropped record"),
            }
        }
        purged
    }
}

fn stage<T>(name: &str, result: Result<T>) -> StageOutcome<T> {
    match result {
        Ok(value) => StageOutcome::Completed(value),
        Err(e) => {
            warn!(stage = name, error = %e, "Maintenance stage failed");
            StageOutcome::failed(&e)
        }
    }
}

fn pass_through(ids: &[String], context: &QueryContext) -> Vec<RankedCandidate> {
    let total = ids.len();
    ids.iter()
        .enumerate()
        .map(|(rank, id)| {
            let similarity = context
                .similarity_scores
                .as_ref()
                .and_then(|scores| scores.get(rank).copied())
                .unwrap_or(1.0 - rank as f32 / total as f32);
            RankedCandidate {
                memory_id: id.clone(),
                tier: None,
                similarity,
                tier_weight: 1.0,
                score: similarity,
            }
        })
        .collect()
}
