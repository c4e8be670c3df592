//! Aggregate snapshots: when to take them, how to store them compactly, and
//! how to tell when a stored one has been tampered with.

pub mod cache;
pub mod cached;
pub mod codec;
pub mod compression;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod snapshot;
pub mod store;
pub mod strategy;

pub use cache::{CacheBackend, InMemoryCache};
pub use cached::CachedSnapshotStore;
pub use codec::{SnapshotCodec, SnapshotRecord};
pub use common::AggregateId;
pub use compression::{
    CompressionError, CompressionMethod, CompressionStats, MIN_COMPRESSIBLE_BYTES,
    SnapshotCompression,
};
pub use error::{Result, SnapshotError};
pub use event_store::Version;
pub use memory::InMemorySnapshotStore;
pub use postgres::PostgresSnapshotStore;
pub use snapshot::{AggregateSnapshot, CorruptSnapshot};
pub use store::{DEFAULT_RETAIN_COUNT, SnapshotStore, SnapshotStoreConfig};
pub use strategy::{
    AdaptiveConfig, AdaptiveSnapshotStrategy, AdaptiveTrigger, MIN_SNAPSHOT_INTERVAL,
    SimpleSnapshotStrategy, SnapshotCandidate, SnapshotStrategy, SnapshotStrategyConfig,
    SystemLoad, TimeBasedStrategy,
};
