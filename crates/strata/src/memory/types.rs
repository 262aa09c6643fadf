//! Memory types for the Strata system
//!
//! Defines the subset of the external memory record this crate reads and
//! writes, the tier identifier, and the tier assignment side-table row.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lowest accepted importance weight
pub const MIN_WEIGHT: f32 = 1.0;

/// Highest accepted importance weight
pub const MAX_WEIGHT: f32 = 10.0;

/// Weight used when a record is touched before anyone supplied one
pub const NEUTRAL_WEIGHT: f32 = 5.0;

/// Check that a weight lies inside [`MIN_WEIGHT`, `MAX_WEIGHT`] (NaN is rejected)
pub fn is_valid_weight(weight: f32) -> bool {
    (MIN_WEIGHT..=MAX_WEIGHT).contains(&weight)
}

/// A memory record as owned by the external store.
///
/// Only the fields the tiering layer needs are modelled here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier for this memory
    pub id: String,
    /// Legacy importance weight (1.0 - 10.0)
    pub weight: f32,
    /// When this memory was created
    pub created_at: DateTime<Utc>,
    /// When this memory was last accessed
    pub last_accessed: DateTime<Utc>,
    /// How many times this memory has been accessed
    pub access_count: u32,
    /// Tier annotation added on the way out of storage enhancement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl MemoryRecord {
    /// Create a new record with the given weight and fresh timestamps
    pub fn new(id: impl Into<String>, weight: f32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            weight,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            tier: None,
        }
    }

    /// Mark this record as accessed, updating access count and timestamp
    pub fn mark_accessed(&mut self) {
        self.access_count += 1;
        self.last_accessed = Utc::now();
    }
}

/// Identifier of a tier in the configured ladder.
///
/// Tiers are data, not an enum: the ladder in the configuration decides which
/// names exist and in which order. The four default names are provided as
/// constructors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tier(String);

impl Tier {
    pub const CORE: &'static str = "core";
    pub const ARCHIVE: &'static str = "archive";
    pub const LONG_TERM: &'static str = "long_term";
    pub const SHORT_TERM: &'static str = "short_term";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn core() -> Self {
        Self::new(Self::CORE)
    }

    pub fn archive() -> Self {
        Self::new(Self::ARCHIVE)
    }

    pub fn long_term() -> Self {
        Self::new(Self::LONG_TERM)
    }

    pub fn short_term() -> Self {
        Self::new(Self::SHORT_TERM)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tier {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Side-table row recording which tier a memory lives in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierAssignment {
    /// Identifier of the memory record this row belongs to
    pub memory_id: String,
    /// Tier the memory currently lives in
    pub tier: Tier,
    /// Weight snapshot taken when the tier was assigned
    pub weight: f32,
    /// When the assignment was first created
    pub created_at: DateTime<Utc>,
    /// When the memory was last touched through this layer
    pub last_accessed: DateTime<Utc>,
    /// How many times the memory was touched through this layer
    pub access_count: u32,
    /// Derived promotion score (0.0+), refreshed on access and maintenance
    pub promotion_score: f32,
    /// Free-form annotations
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Optimistic concurrency counter, bumped by the store on every write
    #[serde(default)]
    pub version: u64,
}

impl TierAssignment {
    /// Create a fresh, unversioned assignment
    pub fn new(memory_id: impl Into<String>, tier: Tier, weight: f32) -> Self {
        let now = Utc::now();
        Self {
            memory_id: memory_id.into(),
            tier,
            weight,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            promotion_score: 0.0,
            metadata: BTreeMap::new(),
            version: 0,
        }
    }

    /// Version a compare-and-swap against this row should expect
    pub fn expected_version(&self) -> Option<u64> {
        if self.version == 0 {
            None
        } else {
            Some(self.version)
        }
    }
}

/// Caller-supplied context for an access update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessContext {
    /// Weight to use when the access has to lazily create an assignment
    pub weight: Option<f32>,
    /// Query that caused the access, kept for diagnostics
    pub query: Option<String>,
}

impl AccessContext {
    pub fn with_weight(weight: f32) -> Self {
        Self {
            weight: Some(weight),
            query: None,
        }
    }
}
