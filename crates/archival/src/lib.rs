//! Tiered archival of event streams.
//!
//! Idle aggregates move from the hot tier to the warm tier, expired warm
//! partitions move to cold blob storage, and cold archives can be restored,
//! migrated back to warm, or repaired.

pub mod cold;
pub mod error;
pub mod layout;
pub mod manager;

pub use cold::{ColdStorage, FilesystemColdStorage, InMemoryColdStorage};
pub use error::{ArchivalError, Result};
pub use layout::{ArchiveChunk, ManifestEntry, PartitionManifest};
pub use manager::{
    ArchivalConfig, ArchivalRunReport, ArchivalStatistics, CleanupReport, ColdStats,
    EventArchivalManager, MigrationReport, RunRecord,
};
