//! Maintenance cycle reporting and scheduling
//!
//! A cycle runs cleanup, promotion, balancing, synchronization and a metrics
//! snapshot in that order. Every stage records its own outcome so one failed
//! stage never hides the others.

pub mod scheduler;

pub use scheduler::{MaintenanceScheduler, SchedulerHandle};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StrataError;
use crate::tiering::lifecycle::{BalanceReport, CleanupReport, PromotionReport};
use crate::tiering::monitor::SystemMetrics;
use crate::tiering::sync::SyncReport;

/// Cooperative cancellation flag checked between per-tier batches
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one stage of a maintenance cycle
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome<T> {
    Completed(T),
    Failed { error: String, transient: bool },
    Skipped { reason: String },
}

impl<T> StageOutcome<T> {
    pub fn failed(error: &StrataError) -> Self {
        Self::Failed {
            error: error.to_string(),
            transient: error.is_transient(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn completed(&self) -> Option<&T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    fn is_transient_failure(&self) -> bool {
        matches!(self, Self::Failed { transient: true, .. })
    }
}

/// Combined report of one maintenance cycle
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cleanup: StageOutcome<CleanupReport>,
    pub promotion: StageOutcome<PromotionReport>,
    pub balance: StageOutcome<BalanceReport>,
    pub sync: StageOutcome<SyncReport>,
    pub snapshot: StageOutcome<SystemMetrics>,
    /// Records deleted from the memory store after expiry or eviction
    pub purged_records: usize,
    /// Set when the cycle stopped early on request
    pub interrupted: bool,
}

impl MaintenanceReport {
    /// Whether any stage failed
    pub fn has_failures(&self) -> bool {
        self.cleanup.is_failed()
            || self.promotion.is_failed()
            || self.balance.is_failed()
            || self.sync.is_failed()
            || self.snapshot.is_failed()
    }

    /// Whether a stage failed in a way worth retrying before the next
    /// regular cycle
    pub fn has_transient_failures(&self) -> bool {
        self.cleanup.is_transient_failure()
            || self.promotion.is_transient_failure()
            || self.balance.is_transient_failure()
            || self.sync.is_transient_failure()
            || self.snapshot.is_transient_failure()
    }
}
