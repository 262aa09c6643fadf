//! The tiering core
//!
//! - [`LayerManager`] classifies weights and owns assignment writes
//! - [`LifecycleManager`] expires, promotes and balances tiers
//! - [`Synchronizer`] keeps weights and tiers in agreement
//! - [`RetrievalEnhancer`] re-weights ranked candidates by tier
//! - [`Monitor`] reports capacity, drift and latency

pub mod layer;
pub mod lifecycle;
pub mod monitor;
pub mod retrieval;
pub mod sync;

pub use layer::LayerManager;
pub use lifecycle::{BalanceReport, CleanupReport, LifecycleManager, PromotionReport, TierMove};
pub use monitor::{
    AlertLevel, CapacityAlert, LatencyStats, Monitor, PerformanceReport, SyncStatus, SystemMetrics,
    TierMetrics,
};
pub use retrieval::{QueryContext, RankedCandidate, RetrievalEnhancer};
pub use sync::{ConsistencyReport, FixReport, Inconsistency, SyncReport, Synchronizer};
