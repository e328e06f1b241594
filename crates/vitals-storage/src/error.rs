//! Error types for the storage engine.

use thiserror::Error;

use vitals_core::MetricKind;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("metric not found: {kind} {name}")]
    NotFound { kind: MetricKind, name: String },

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("snapshot file error: {0}")]
    Snapshot(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored row for {0} has no payload column")]
    CorruptRow(String),
}

impl StorageError {
    /// Whether this error is the expected miss on a lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    /// Whether a retry might help: infrastructure failures only, never
    /// lookup misses, validation problems, or unsupported operations.
    /// A missing snapshot file counts as a miss, not an outage.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(_) => true,
            StorageError::Snapshot(e) => e.kind() != std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
