use thiserror::Error;

use crate::{AggregateId, Version, compression::CompressionError};

/// Errors that can occur when saving or loading snapshots.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Compressing or decompressing snapshot state failed.
    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored state could not be decoded, neither compressed nor raw.
    #[error("Snapshot {aggregate_id}@{version} could not be decoded: {reason}")]
    Decode {
        aggregate_id: AggregateId,
        version: Version,
        reason: String,
    },

    /// A strategy or store was configured with invalid parameters.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The cache backend failed.
    #[error("Cache error: {0}")]
    Cache(String),
}

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;
