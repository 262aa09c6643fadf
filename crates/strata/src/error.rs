//! Error types for Strata

use thiserror::Error;

/// Main error type for Strata operations
#[derive(Error, Debug)]
pub enum StrataError {
    /// Importance weight outside the accepted [1.0, 10.0] range
    #[error("Invalid weight: {0} (expected a value between 1.0 and 10.0)")]
    InvalidWeight(f32),

    /// Missing record or tier assignment
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient failure of a storage collaborator (LanceDB, file system, etc.)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Overlapping or malformed tier configuration
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    /// Weight and tier disagree for a record
    #[error("Consistency drift: {0}")]
    ConsistencyDrift(String),

    /// An optimistic write lost against a concurrent writer
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Caller supplied malformed input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StrataError {
    /// Whether the failure is worth retrying on a later maintenance run
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StrataError::StoreUnavailable(_) | StrataError::Conflict(_) | StrataError::Io(_)
        )
    }
}

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
