//! Monitor: capacity, sync status and latency reporting
//!
//! Everything here is read-only with respect to the assignment table. Sync
//! status comes from the consistency report the synchronizer caches; the
//! monitor never scans records itself.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::layer::LayerManager;
use super::sync::ConsistencyHandle;
use crate::config::ConfigManager;
use crate::error::Result;
use crate::memory::types::Tier;

/// Bounded per-operation latency samples
#[derive(Default)]
pub struct LatencyTracker {
    samples: Mutex<HashMap<String, VecDeque<Duration>>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sample, keeping at most the `window` most recent ones for the
    /// operation. A smaller window than before drops the oldest samples.
    pub fn record(&self, operation: &str, duration: Duration, window: usize) {
        let window = window.max(1);
        let mut samples = self.samples.lock();
        let queue = samples.entry(operation.to_string()).or_default();
        while queue.len() >= window {
            queue.pop_front();
        }
        queue.push_back(duration);
    }

    /// Stats per operation, sorted by operation name
    pub fn stats(&self) -> Vec<LatencyStats> {
        let samples = self.samples.lock();
        let mut stats: Vec<LatencyStats> = samples
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(operation, queue)| LatencyStats::from_samples(operation, queue))
            .collect();
        stats.sort_by(|a, b| a.operation.cmp(&b.operation));
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyStats {
    pub operation: String,
    pub count: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    fn from_samples(operation: &str, queue: &VecDeque<Duration>) -> Self {
        let mut sorted: Vec<f64> = queue.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let mean_ms = sorted.iter().sum::<f64>() / count as f64;
        Self {
            operation: operation.to_string(),
            count,
            mean_ms,
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            max_ms: sorted.last().copied().unwrap_or(0.0),
        }
    }
}

/// Nearest-rank percentile of sorted samples
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Drifted,
    /// No consistency report yet
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierMetrics {
    pub tier: Tier,
    pub count: usize,
    pub max_records: usize,
    pub usage_ratio: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub collected_at: DateTime<Utc>,
    pub tiers: Vec<TierMetrics>,
    pub total_assignments: usize,
    pub sync_status: SyncStatus,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub inconsistent_count: usize,
    pub latency: Vec<LatencyStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityAlert {
    pub tier: Tier,
    pub level: AlertLevel,
    pub usage_ratio: f32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub latency: Vec<LatencyStats>,
    pub recommendations: Vec<String>,
}

pub struct Monitor {
    config: Arc<ConfigManager>,
    layers: Arc<LayerManager>,
    consistency: ConsistencyHandle,
    latency: LatencyTracker,
}

impl Monitor {
    pub fn new(
        config: Arc<ConfigManager>,
        layers: Arc<LayerManager>,
        consistency: ConsistencyHandle,
    ) -> Self {
        Self {
            config,
            layers,
            consistency,
            latency: LatencyTracker::new(),
        }
    }

    /// Record a hook latency against the currently configured window
    pub fn record_latency(&self, operation: &str, duration: Duration) {
        let window = self.config.monitor().latency_window;
        self.latency.record(operation, duration, window);
    }

    pub async fn get_system_metrics(&self) -> Result<SystemMetrics> {
        let config = self.config.snapshot();
        let mut tiers = Vec::with_capacity(config.tiers.len());

        for tier in &config.tiers {
            let count = self.layers.count_by_tier(&tier.name).await?;
            tiers.push(TierMetrics {
                tier: tier.name.clone(),
                count,
                max_records: tier.max_records,
                usage_ratio: count as f32 / tier.max_records as f32,
            });
        }

        let (sync_status, last_verified_at, inconsistent_count) = match &*self.consistency.read() {
            Some(report) if report.inconsistent_count == 0 => {
                (SyncStatus::Synced, Some(report.checked_at), 0)
            }
            Some(report) => (
                SyncStatus::Drifted,
                Some(report.checked_at),
                report.inconsistent_count,
            ),
            None => (SyncStatus::Unknown, None, 0),
        };

        Ok(SystemMetrics {
            collected_at: Utc::now(),
            total_assignments: tiers.iter().map(|t| t.count).sum(),
            tiers,
            sync_status,
            last_verified_at,
            inconsistent_count,
            latency: self.latency.stats(),
        })
    }

    pub async fn get_capacity_alerts(&self) -> Result<Vec<CapacityAlert>> {
        let metrics = self.get_system_metrics().await?;
        Ok(self.alerts_for(&metrics))
    }

    /// Capacity alerts derived from an existing metrics snapshot
    pub fn alerts_for(&self, metrics: &SystemMetrics) -> Vec<CapacityAlert> {
        let thresholds = self.config.snapshot().monitor;

        metrics
            .tiers
            .iter()
            .filter_map(|t| {
                let level = if t.usage_ratio > thresholds.critical_ratio {
                    AlertLevel::Critical
                } else if t.usage_ratio > thresholds.warning_ratio {
                    AlertLevel::Warning
                } else {
                    return None;
                };
                debug!(tier = %t.tier, ratio = t.usage_ratio, ?level, "Capacity alert");
                Some(CapacityAlert {
                    tier: t.tier.clone(),
                    level,
                    usage_ratio: t.usage_ratio,
                    message: format!(
                        "Tier {} holds {} of {} records ({:.0}%)",
                        t.tier,
                        t.count,
                        t.max_records,
                        t.usage_ratio * 100.0
                    ),
                })
            })
            .collect()
    }

    /// Latency statistics plus rule-based recommendations
    pub async fn get_performance_report(&self) -> Result<PerformanceReport> {
        let config = self.config.snapshot();
        let metrics = self.get_system_metrics().await?;
        let mut recommendations = Vec::new();

        for tier in &metrics.tiers {
            if tier.usage_ratio > config.monitor.warning_ratio {
                recommendations.push(format!(
                    "Tier {} is near capacity ({:.0}%); consider raising max_records or lowering the promotion threshold of the tier below",
                    tier.tier,
                    tier.usage_ratio * 100.0
                ));
            }
        }

        match metrics.last_verified_at {
            None => recommendations.push(
                "Consistency has not been verified yet; run a sync or verification pass".to_string(),
            ),
            Some(checked_at) => {
                let max_age = chrono::Duration::seconds(
                    i64::try_from(config.system.sync_interval_secs.saturating_mul(2))
                        .unwrap_or(i64::MAX),
                );
                if Utc::now() - checked_at > max_age {
                    recommendations.push(format!(
                        "Last consistency verification is older than {}s; check that synchronization is running",
                        max_age.num_seconds()
                    ));
                }
            }
        }

        if metrics.inconsistent_count > 0 {
            recommendations.push(format!(
                "{} records have drifted between weight and tier; run fix_inconsistencies or a full sync",
                metrics.inconsistent_count
            ));
        }

        let budget_ms = config.monitor.latency_budget_ms as f64;
        for stats in &metrics.latency {
            if stats.p95_ms > budget_ms {
                recommendations.push(format!(
                    "Operation {} p95 latency {:.1}ms exceeds the {budget_ms:.0}ms budget",
                    stats.operation, stats.p95_ms
                ));
            }
        }

        Ok(PerformanceReport {
            latency: metrics.latency,
            recommendations,
        })
    }
}
