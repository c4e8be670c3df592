use thiserror::Error;

use crate::{AggregateId, Version};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// A concurrency conflict occurred when appending events.
    /// The expected version did not match the actual version.
    #[error(
        "Concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: Version,
        actual: Version,
    },

    /// An event arrived out of the order the sequencer accepts.
    #[error(
        "Ordering violation for aggregate {aggregate_id}: expected version {expected}, found {found}"
    )]
    OrderingViolation {
        aggregate_id: AggregateId,
        expected: Version,
        found: Version,
    },

    /// An imported event would land on a version already held by another event.
    #[error("Import collision for aggregate {aggregate_id}: versions {versions:?} hold other events")]
    ImportCollision {
        aggregate_id: AggregateId,
        versions: Vec<Version>,
    },

    /// The batch handed to `append` was malformed (mixed aggregates, wrong aggregate id).
    #[error("Invalid event batch: {0}")]
    InvalidBatch(String),

    /// An event type that no serializer registration knows about.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true for errors a caller should answer by reloading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
