//! Append-only event storage with optimistic concurrency, per-aggregate
//! ordering, and hot/warm tiering.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod sequencer;
pub mod serializer;
pub mod store;
pub mod tiered;

pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version, VersionRange, metadata_keys};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::{EventQuery, Page};
pub use sequencer::{DEFAULT_MAX_TRACKED, DEFAULT_REORDER_WINDOW, EventSequencer, OrderingMode};
pub use serializer::{DomainEvent, EventContext, EventSerializer, Upcaster};
pub use store::{
    AppendOptions, BatchResult, EventStore, EventStoreExt, HotTier, PartitionInfo, TierStats,
    WarmTier,
};
pub use tiered::{MirrorMode, TieredConfig, TieredEventStore};
