use std::io;

use event_store::{AggregateId, EventStoreError, Version};
use snapshot_store::CompressionError;
use thiserror::Error;

/// Errors raised while moving events between tiers.
#[derive(Debug, Error)]
pub enum ArchivalError {
    /// The cold storage backend failed.
    #[error("Storage error at {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Event store error: {0}")]
    EventStore(#[source] EventStoreError),

    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    /// An archive exists but cannot be decoded.
    #[error("Corrupted archive {path}: {reason}")]
    Corrupted { path: String, reason: String },

    /// Warm did not hold the full stream after an import, so the source was kept.
    #[error(
        "Warm tier behind for aggregate {aggregate_id}: expected version {hot_version}, found {warm_version}"
    )]
    WarmBehind {
        aggregate_id: AggregateId,
        hot_version: Version,
        warm_version: Version,
    },

    /// The destination tier holds different events under versions the source
    /// also holds. The source is kept.
    #[error("Version collision for aggregate {aggregate_id} at versions {versions:?}")]
    VersionCollision {
        aggregate_id: AggregateId,
        versions: Vec<Version>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<EventStoreError> for ArchivalError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::ImportCollision {
                aggregate_id,
                versions,
            } => ArchivalError::VersionCollision {
                aggregate_id,
                versions,
            },
            other => ArchivalError::EventStore(other),
        }
    }
}

impl ArchivalError {
    pub(crate) fn storage(path: impl Into<String>, source: io::Error) -> Self {
        ArchivalError::Storage {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchivalError>;
