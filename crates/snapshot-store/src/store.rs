use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::{
    AggregateId, AggregateSnapshot, CorruptSnapshot, Version,
    codec::SnapshotCodec,
    compression::{CompressionMethod, SnapshotCompression},
    error::Result,
};

/// Snapshots kept per aggregate unless configured otherwise.
pub const DEFAULT_RETAIN_COUNT: usize = 3;

/// Settings shared by the snapshot store backends.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotStoreConfig {
    /// Newest snapshots kept per aggregate after each save.
    pub retain_count: usize,
    pub compression: CompressionMethod,
    /// `None` uses the method's default level.
    pub compression_level: Option<i32>,
    /// Compressed state is kept only when it is smaller than this fraction of the original.
    pub min_compression_ratio: f64,
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        Self {
            retain_count: DEFAULT_RETAIN_COUNT,
            compression: CompressionMethod::None,
            compression_level: None,
            min_compression_ratio: 0.9,
        }
    }
}

impl SnapshotStoreConfig {
    /// Builds the codec, failing if the compression settings are unusable.
    pub fn codec(&self) -> Result<SnapshotCodec> {
        let level = self
            .compression_level
            .unwrap_or_else(|| self.compression.default_level());
        let compression = SnapshotCompression::new(self.compression, level)?;
        Ok(SnapshotCodec::new(compression, self.min_compression_ratio))
    }

    pub(crate) fn retain_count(&self) -> usize {
        self.retain_count.max(1)
    }
}

/// Persistence for aggregate snapshots.
///
/// Snapshots are keyed by `(aggregate_id, version)`. Saving prunes the
/// aggregate's older snapshots down to the store's retain count.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Upserts a snapshot, then prunes. Returns the versions pruned.
    async fn save(&self, snapshot: AggregateSnapshot) -> Result<Vec<Version>>;

    /// The newest snapshot of an aggregate.
    async fn load(&self, aggregate_id: AggregateId) -> Result<Option<AggregateSnapshot>>;

    /// A snapshot at exactly `version`.
    async fn load_version(
        &self,
        aggregate_id: AggregateId,
        version: Version,
    ) -> Result<Option<AggregateSnapshot>>;

    /// Versions held for an aggregate, ascending.
    async fn versions(&self, aggregate_id: AggregateId) -> Result<Vec<Version>>;

    /// Deletes every snapshot of an aggregate. Returns the number removed.
    async fn remove_all(&self, aggregate_id: AggregateId) -> Result<usize>;

    /// Deletes snapshots created more than `older_than_days` ago, always
    /// keeping each aggregate's newest one. Returns the snapshots removed.
    async fn archive_old_snapshots(
        &self,
        older_than_days: u32,
    ) -> Result<Vec<(AggregateId, Version)>>;

    /// Recomputes every stored snapshot's hash and reports the mismatches.
    async fn verify_integrity(&self) -> Result<Vec<CorruptSnapshot>>;

    async fn exists(&self, aggregate_id: AggregateId) -> Result<bool> {
        Ok(!self.versions(aggregate_id).await?.is_empty())
    }

    /// Loads the newest snapshot of several aggregates concurrently.
    async fn load_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> HashMap<AggregateId, Result<Option<AggregateSnapshot>>> {
        let loads = aggregate_ids
            .iter()
            .map(|id| async move { (*id, self.load(*id).await) });
        join_all(loads).await.into_iter().collect()
    }
}

/// Checks one decoded snapshot against its stored hash.
pub(crate) fn check_integrity(snapshot: &AggregateSnapshot) -> Option<CorruptSnapshot> {
    let computed = AggregateSnapshot::compute_hash(
        snapshot.aggregate_id,
        &snapshot.aggregate_type,
        snapshot.version,
        &snapshot.state,
    );
    (computed != snapshot.hash).then(|| CorruptSnapshot {
        aggregate_id: snapshot.aggregate_id,
        version: snapshot.version,
        stored_hash: snapshot.hash.clone(),
        computed_hash: Some(computed),
    })
}
