//! Domain error types.

use common::AggregateId;
use event_store::{EventStoreError, Version};
use snapshot_store::SnapshotError;
use thiserror::Error;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// The aggregate refused the command.
    #[error("Command rejected: {0}")]
    Rejected(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Aggregate not found.
    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    AggregateNotFound {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    /// The stored stream skips versions, e.g. because older events were
    /// archived to cold storage and not restored.
    #[error(
        "Incomplete event stream for aggregate {aggregate_id}: expected version {expected}, found {found}"
    )]
    IncompleteStream {
        aggregate_id: AggregateId,
        expected: Version,
        found: Version,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// True when reloading the aggregate and retrying the command may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DomainError::EventStore(e) if e.is_conflict())
    }
}
