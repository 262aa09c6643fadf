//! Memory types and scoring
//!
//! Defines the record subset read from the external store, the tier
//! assignment side-table row, and the promotion score shared by the
//! tiering components.

pub mod score;
pub mod types;

pub use score::{promotion_score, recency_factor};
pub use types::{AccessContext, MemoryRecord, Tier, TierAssignment};
