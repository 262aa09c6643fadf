//! Strata - tiered memory management for conversational agents
//!
//! Memories carry an importance weight; this crate sorts them into a ladder of
//! tiers, keeps the tiers in line with the weights, and runs the lifecycle
//! (expiry, promotion, capacity balancing) over them.

pub mod config;
pub mod error;
pub mod maintenance;
pub mod memory;
pub mod service;
pub mod storage;
pub mod testing;
pub mod tiering;

pub use error::{Result, StrataError};
pub use maintenance::{Interrupt, MaintenanceReport, MaintenanceScheduler, SchedulerHandle};
pub use service::{SystemStatus, TieredContext, TieringService};
