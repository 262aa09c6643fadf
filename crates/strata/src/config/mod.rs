//! Configuration for Strata
//!
//! Everything is plain data deserialized from TOML. The tier ladder is an
//! ordered list (highest retention priority first); promotion and demotion
//! only ever look at the neighbouring entry in that list.

mod manager;

pub use manager::ConfigManager;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::memory::types::{MAX_WEIGHT, MIN_WEIGHT, NEUTRAL_WEIGHT, Tier, is_valid_weight};

/// Main configuration structure for the Strata daemon
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct Config {
    /// Where the LanceDB tables live
    #[serde(default)]
    pub storage: StorageConfig,
    /// Tiering behaviour
    #[serde(default)]
    pub tiering: TieringConfig,
}

/// Storage location configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StorageConfig {
    /// Base directory for all storage data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}

/// Everything the tiering components read
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TieringConfig {
    /// Global toggles and cadences
    #[serde(default)]
    pub system: SystemConfig,
    /// Tier ladder, highest retention priority first
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
    /// Promotion score weights
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Query routing for retrieval
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Alert thresholds and latency tracking
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Weight/tier reconciliation policy
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            tiers: default_tiers(),
            scoring: ScoringConfig::default(),
            retrieval: RetrievalConfig::default(),
            monitor: MonitorConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl TieringConfig {
    /// Look up a tier's configuration by name
    pub fn tier(&self, tier: &Tier) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| &t.name == tier)
    }

    /// Position of a tier in the ladder (0 = highest priority)
    pub fn rank(&self, tier: &Tier) -> Option<usize> {
        self.tiers.iter().position(|t| &t.name == tier)
    }

    /// The next tier up the ladder, if any
    pub fn tier_above(&self, tier: &Tier) -> Option<&TierConfig> {
        let rank = self.rank(tier)?;
        rank.checked_sub(1).and_then(|r| self.tiers.get(r))
    }

    /// The next tier down the ladder, if any
    pub fn tier_below(&self, tier: &Tier) -> Option<&TierConfig> {
        let rank = self.rank(tier)?;
        self.tiers.get(rank + 1)
    }

    /// The lowest tier of the ladder
    pub fn lowest_tier(&self) -> Option<&TierConfig> {
        self.tiers.last()
    }

    /// Tier names in ladder order
    pub fn tier_order(&self) -> Vec<Tier> {
        self.tiers.iter().map(|t| t.name.clone()).collect()
    }

    /// Map a weight to a tier: the first tier (highest first) whose floor the
    /// weight reaches.
    pub fn classify(&self, weight: f32) -> Result<&TierConfig> {
        if !is_valid_weight(weight) {
            return Err(StrataError::InvalidWeight(weight));
        }

        self.tiers
            .iter()
            .find(|t| weight >= t.min_weight)
            .or_else(|| self.tiers.last())
            .ok_or_else(|| StrataError::ConfigInvalid("No tiers configured".to_string()))
    }

    /// Reject overlapping, unordered or otherwise malformed configuration
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(StrataError::ConfigInvalid(
                "At least one tier must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for tier in &self.tiers {
            tier.validate()?;
            if !seen.insert(tier.name.clone()) {
                return Err(StrataError::ConfigInvalid(format!(
                    "Duplicate tier name: {}",
                    tier.name
                )));
            }
        }

        for pair in self.tiers.windows(2) {
            let (higher, lower) = (&pair[0], &pair[1]);
            if lower.max_weight >= higher.min_weight {
                return Err(StrataError::ConfigInvalid(format!(
                    "Weight band of {} [{}, {}] overlaps or is above {} [{}, {}]",
                    lower.name,
                    lower.min_weight,
                    lower.max_weight,
                    higher.name,
                    higher.min_weight,
                    higher.max_weight
                )));
            }
            if lower.retrieval_weight > higher.retrieval_weight {
                return Err(StrataError::ConfigInvalid(format!(
                    "Retrieval weight of {} ({}) exceeds that of {} ({})",
                    lower.name, lower.retrieval_weight, higher.name, higher.retrieval_weight
                )));
            }
        }

        if let Some(lowest) = self.tiers.last() {
            if lowest.min_weight > MIN_WEIGHT {
                return Err(StrataError::ConfigInvalid(format!(
                    "Lowest tier {} must start at {MIN_WEIGHT}, starts at {}",
                    lowest.name, lowest.min_weight
                )));
            }
        }

        self.system.validate()?;
        self.scoring.validate()?;
        self.retrieval.validate(self)?;
        self.monitor.validate()?;
        Ok(())
    }
}

/// Global toggles and cadences
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SystemConfig {
    /// Run the synchronizer on its own timer
    #[serde(default = "default_auto_sync_enabled")]
    pub auto_sync_enabled: bool,
    /// Seconds between standalone sync runs
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Run the maintenance cycle on a timer
    #[serde(default = "default_auto_maintenance_enabled")]
    pub auto_maintenance_enabled: bool,
    /// Seconds between maintenance cycles
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    /// Weight used when an access lazily creates an assignment
    #[serde(default = "default_weight")]
    pub default_weight: f32,
    /// Page size for per-tier maintenance scans
    #[serde(default = "default_maintenance_batch_size")]
    pub maintenance_batch_size: usize,
    /// Delete the underlying record when its assignment expires or is evicted
    #[serde(default = "default_purge_dropped_records")]
    pub purge_dropped_records: bool,
    /// First retry delay after a transient maintenance failure
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            auto_sync_enabled: default_auto_sync_enabled(),
            sync_interval_secs: default_sync_interval_secs(),
            auto_maintenance_enabled: default_auto_maintenance_enabled(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            default_weight: default_weight(),
            maintenance_batch_size: default_maintenance_batch_size(),
            purge_dropped_records: default_purge_dropped_records(),
            retry_base_secs: default_retry_base_secs(),
        }
    }
}

impl SystemConfig {
    fn validate(&self) -> Result<()> {
        if !is_valid_weight(self.default_weight) {
            return Err(StrataError::ConfigInvalid(format!(
                "default_weight {} is outside [{MIN_WEIGHT}, {MAX_WEIGHT}]",
                self.default_weight
            )));
        }
        if self.maintenance_batch_size == 0 {
            return Err(StrataError::ConfigInvalid(
                "maintenance_batch_size must be at least 1".to_string(),
            ));
        }
        if self.sync_interval_secs == 0 || self.maintenance_interval_secs == 0 {
            return Err(StrataError::ConfigInvalid(
                "Intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_auto_sync_enabled() -> bool {
    true
}

fn default_sync_interval_secs() -> u64 {
    3600
}

fn default_auto_maintenance_enabled() -> bool {
    true
}

fn default_maintenance_interval_secs() -> u64 {
    4 * 3600
}

fn default_weight() -> f32 {
    NEUTRAL_WEIGHT
}

fn default_maintenance_batch_size() -> usize {
    500
}

fn default_purge_dropped_records() -> bool {
    true
}

fn default_retry_base_secs() -> u64 {
    60
}

/// Per-tier limits and thresholds
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TierConfig {
    /// Tier identifier
    pub name: Tier,
    /// Lowest weight that classifies into this tier (inclusive)
    pub min_weight: f32,
    /// Highest weight of this tier's band (inclusive)
    pub max_weight: f32,
    /// Maximum number of assignments before balancing pushes records down
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    /// Days without access after which a record may expire
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Minimum hours between two cleanup passes over this tier
    #[serde(default)]
    pub cleanup_interval_hours: u32,
    /// Promotion score above which a record moves one tier up
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: f32,
    /// Retrieval multiplier applied to candidates in this tier
    #[serde(default = "default_retrieval_weight")]
    pub retrieval_weight: f32,
    /// Whether cleanup may expire records from this tier
    #[serde(default = "default_auto_expire")]
    pub auto_expire: bool,
}

impl TierConfig {
    /// Width of the weight band, never zero
    pub fn band_width(&self) -> f32 {
        (self.max_weight - self.min_weight).max(f32::EPSILON)
    }

    fn validate(&self) -> Result<()> {
        if self.name.as_str().trim().is_empty() {
            return Err(StrataError::ConfigInvalid(
                "Tier name must not be empty".to_string(),
            ));
        }
        if !self.min_weight.is_finite()
            || !self.max_weight.is_finite()
            || self.min_weight > self.max_weight
        {
            return Err(StrataError::ConfigInvalid(format!(
                "Tier {} has a malformed weight band [{}, {}]",
                self.name, self.min_weight, self.max_weight
            )));
        }
        if self.min_weight > MAX_WEIGHT || self.max_weight < MIN_WEIGHT {
            return Err(StrataError::ConfigInvalid(format!(
                "Tier {} band [{}, {}] lies outside [{MIN_WEIGHT}, {MAX_WEIGHT}]",
                self.name, self.min_weight, self.max_weight
            )));
        }
        if self.max_records == 0 {
            return Err(StrataError::ConfigInvalid(format!(
                "Tier {} must allow at least one record",
                self.name
            )));
        }
        if !(self.promotion_threshold >= 0.0) {
            return Err(StrataError::ConfigInvalid(format!(
                "Tier {} promotion_threshold must be non-negative",
                self.name
            )));
        }
        if !(self.retrieval_weight > 0.0) {
            return Err(StrataError::ConfigInvalid(format!(
                "Tier {} retrieval_weight must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_max_records() -> usize {
    10_000
}

fn default_retention_days() -> u32 {
    90
}

fn default_promotion_threshold() -> f32 {
    0.7
}

fn default_retrieval_weight() -> f32 {
    1.0
}

fn default_auto_expire() -> bool {
    true
}

/// The default four-tier ladder
pub fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            name: Tier::core(),
            min_weight: 9.0,
            max_weight: 10.0,
            max_records: 1_000,
            retention_days: 365,
            cleanup_interval_hours: 168,
            promotion_threshold: 1.0,
            retrieval_weight: 1.3,
            auto_expire: false,
        },
        TierConfig {
            name: Tier::archive(),
            min_weight: 7.0,
            max_weight: 8.9,
            max_records: 5_000,
            retention_days: 180,
            cleanup_interval_hours: 24,
            promotion_threshold: 0.75,
            retrieval_weight: 1.15,
            auto_expire: true,
        },
        TierConfig {
            name: Tier::long_term(),
            min_weight: 4.0,
            max_weight: 6.9,
            max_records: 10_000,
            retention_days: 90,
            cleanup_interval_hours: 12,
            promotion_threshold: 0.7,
            retrieval_weight: 1.0,
            auto_expire: true,
        },
        TierConfig {
            name: Tier::short_term(),
            min_weight: 1.0,
            max_weight: 3.9,
            max_records: 20_000,
            retention_days: 7,
            cleanup_interval_hours: 6,
            promotion_threshold: 0.65,
            retrieval_weight: 0.85,
            auto_expire: true,
        },
    ]
}

/// Weights of the promotion score components
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ScoringConfig {
    /// Weight of the normalized access count
    #[serde(default = "default_access_weight")]
    pub access_weight: f32,
    /// Weight of the recency factor
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f32,
    /// Weight of the record's position inside its tier's weight band
    #[serde(default = "default_importance_weight")]
    pub importance_weight: f32,
    /// Access count at which the access component saturates
    #[serde(default = "default_access_saturation")]
    pub access_saturation: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            access_weight: default_access_weight(),
            recency_weight: default_recency_weight(),
            importance_weight: default_importance_weight(),
            access_saturation: default_access_saturation(),
        }
    }
}

impl ScoringConfig {
    fn validate(&self) -> Result<()> {
        let weights = [self.access_weight, self.recency_weight, self.importance_weight];
        if weights.iter().any(|w| !(*w >= 0.0)) {
            return Err(StrataError::ConfigInvalid(
                "Scoring weights must be non-negative".to_string(),
            ));
        }
        if weights.iter().sum::<f32>() <= 0.0 {
            return Err(StrataError::ConfigInvalid(
                "At least one scoring weight must be positive".to_string(),
            ));
        }
        if self.access_saturation == 0 {
            return Err(StrataError::ConfigInvalid(
                "access_saturation must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_access_weight() -> f32 {
    0.4
}

fn default_recency_weight() -> f32 {
    0.3
}

fn default_importance_weight() -> f32 {
    0.3
}

fn default_access_saturation() -> u32 {
    100
}

/// Query-kind routing for the retrieval enhancer
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetrievalConfig {
    /// Preferred tier search order per coarse query category
    #[serde(default = "default_routes")]
    pub routes: BTreeMap<String, Vec<Tier>>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            routes: default_routes(),
        }
    }
}

impl RetrievalConfig {
    fn validate(&self, config: &TieringConfig) -> Result<()> {
        for (kind, tiers) in &self.routes {
            if tiers.is_empty() {
                return Err(StrataError::ConfigInvalid(format!(
                    "Route {kind} lists no tiers"
                )));
            }
            if let Some(unknown) = tiers.iter().find(|t| config.tier(t).is_none()) {
                return Err(StrataError::ConfigInvalid(format!(
                    "Route {kind} references unknown tier {unknown}"
                )));
            }
        }
        Ok(())
    }
}

/// Query category names shipped with the default routes
pub const PERSONAL_FACT: &str = "personal_fact";
pub const RECENT_EVENT: &str = "recent_event";
pub const GENERAL_KNOWLEDGE: &str = "general_knowledge";

fn default_routes() -> BTreeMap<String, Vec<Tier>> {
    let mut routes = BTreeMap::new();
    routes.insert(
        PERSONAL_FACT.to_string(),
        vec![Tier::core(), Tier::archive(), Tier::long_term()],
    );
    routes.insert(
        RECENT_EVENT.to_string(),
        vec![Tier::short_term(), Tier::long_term(), Tier::archive()],
    );
    routes.insert(
        GENERAL_KNOWLEDGE.to_string(),
        vec![
            Tier::archive(),
            Tier::long_term(),
            Tier::core(),
            Tier::short_term(),
        ],
    );
    routes
}

/// Alerting and latency tracking
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MonitorConfig {
    /// Usage ratio above which a warning alert is raised
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f32,
    /// Usage ratio above which a critical alert is raised
    #[serde(default = "default_critical_ratio")]
    pub critical_ratio: f32,
    /// Number of latency samples kept per operation
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
    /// p95 latency above which a recommendation is emitted
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warning_ratio: default_warning_ratio(),
            critical_ratio: default_critical_ratio(),
            latency_window: default_latency_window(),
            latency_budget_ms: default_latency_budget_ms(),
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<()> {
        if !(self.warning_ratio > 0.0 && self.warning_ratio < self.critical_ratio) {
            return Err(StrataError::ConfigInvalid(format!(
                "warning_ratio ({}) must be positive and below critical_ratio ({})",
                self.warning_ratio, self.critical_ratio
            )));
        }
        if self.latency_window == 0 {
            return Err(StrataError::ConfigInvalid(
                "latency_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_warning_ratio() -> f32 {
    0.8
}

fn default_critical_ratio() -> f32 {
    0.95
}

fn default_latency_window() -> usize {
    1000
}

fn default_latency_budget_ms() -> u64 {
    50
}

/// Which field wins when weight and tier disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Re-tier the assignment from the record's weight
    #[default]
    WeightWins,
    /// Clamp the record's weight into the assigned tier's band
    TierWins,
}

/// Synchronizer behaviour
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SyncConfig {
    #[serde(default)]
    pub policy: SyncPolicy,
    /// Allow weight decay to move a record down the ladder
    #[serde(default = "default_allow_demotion")]
    pub allow_demotion: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            policy: SyncPolicy::default(),
            allow_demotion: default_allow_demotion(),
        }
    }
}

fn default_allow_demotion() -> bool {
    true
}
