//! Runtime holder for the active tiering configuration.
//!
//! Components keep an `Arc<ConfigManager>` and take a snapshot at the start of
//! every operation, so a change is picked up on the next read and never in the
//! middle of a pass. Already-assigned tiers are not recomputed when thresholds
//! change; a full sync has to be requested explicitly.

use parking_lot::RwLock;

use super::{MonitorConfig, SystemConfig, TierConfig, TieringConfig};
use crate::error::{Result, StrataError};
use crate::memory::types::Tier;

/// Owns the active [`TieringConfig`]
#[derive(Debug)]
pub struct ConfigManager {
    inner: RwLock<TieringConfig>,
}

impl ConfigManager {
    /// Validate and wrap a configuration
    pub fn new(config: TieringConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: RwLock::new(config),
        })
    }

    /// A consistent copy of the whole configuration
    pub fn snapshot(&self) -> TieringConfig {
        self.inner.read().clone()
    }

    pub fn system(&self) -> SystemConfig {
        self.inner.read().system.clone()
    }

    pub fn monitor(&self) -> MonitorConfig {
        self.inner.read().monitor.clone()
    }

    pub fn tier(&self, tier: &Tier) -> Result<TierConfig> {
        self.inner
            .read()
            .tier(tier)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(format!("Tier not configured: {tier}")))
    }

    /// Replace the configuration of an existing tier
    pub fn set_tier(&self, tier_config: TierConfig) -> Result<()> {
        self.update(|config| {
            let slot = config
                .tiers
                .iter_mut()
                .find(|t| t.name == tier_config.name)
                .ok_or_else(|| {
                    StrataError::NotFound(format!("Tier not configured: {}", tier_config.name))
                })?;
            *slot = tier_config;
            Ok(())
        })
    }

    /// Insert a new tier at `position` in the ladder (0 = highest priority)
    pub fn insert_tier(&self, position: usize, tier_config: TierConfig) -> Result<()> {
        self.update(|config| {
            if position > config.tiers.len() {
                return Err(StrataError::InvalidInput(format!(
                    "Ladder position {position} is past the end ({} tiers)",
                    config.tiers.len()
                )));
            }
            config.tiers.insert(position, tier_config);
            Ok(())
        })
    }

    pub fn set_system(&self, system: SystemConfig) -> Result<()> {
        self.update(|config| {
            config.system = system;
            Ok(())
        })
    }

    /// Swap in a whole new configuration
    pub fn replace(&self, config: TieringConfig) -> Result<()> {
        config.validate()?;
        *self.inner.write() = config;
        Ok(())
    }

    /// Export as a structured JSON document
    pub fn export(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&*self.inner.read())
            .map_err(|e| StrataError::Serialization(format!("Failed to export config: {e}")))
    }

    /// Import a document produced by [`ConfigManager::export`]
    pub fn import(&self, document: serde_json::Value) -> Result<()> {
        let config: TieringConfig = serde_json::from_value(document)
            .map_err(|e| StrataError::ConfigInvalid(format!("Failed to parse config: {e}")))?;
        self.replace(config)
    }

    /// Export as TOML text
    pub fn export_toml(&self) -> Result<String> {
        toml::to_string(&*self.inner.read())
            .map_err(|e| StrataError::Serialization(format!("Failed to export config: {e}")))
    }

    /// Import TOML text produced by [`ConfigManager::export_toml`]
    pub fn import_toml(&self, document: &str) -> Result<()> {
        let config: TieringConfig = toml::from_str(document)
            .map_err(|e| StrataError::ConfigInvalid(format!("Failed to parse config: {e}")))?;
        self.replace(config)
    }

    /// Apply a mutation to a copy, validate it, and only then publish it
    fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut TieringConfig) -> Result<()>,
    {
        let mut guard = self.inner.write();
        let mut candidate = guard.clone();
        mutate(&mut candidate)?;
        candidate.validate()?;
        *guard = candidate;
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self {
            inner: RwLock::new(TieringConfig::default()),
        }
    }
}
