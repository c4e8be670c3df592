use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use common::{Clock, SystemClock};
use tokio::sync::RwLock;

use crate::{
    AggregateId, AggregateSnapshot, CorruptSnapshot, Version,
    codec::{SnapshotCodec, SnapshotRecord},
    error::Result,
    store::{SnapshotStore, SnapshotStoreConfig, check_integrity},
};

type Records = HashMap<AggregateId, BTreeMap<Version, SnapshotRecord>>;

/// In-memory snapshot store.
///
/// Useful for testing and development. Records go through the same codec as
/// the durable backend, so compression and decoding fallbacks behave alike.
#[derive(Clone)]
pub struct InMemorySnapshotStore {
    records: Arc<RwLock<Records>>,
    codec: SnapshotCodec,
    retain_count: usize,
    clock: Arc<dyn Clock>,
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            codec: SnapshotCodec::default(),
            retain_count: SnapshotStoreConfig::default().retain_count(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl InMemorySnapshotStore {
    /// Creates an empty store with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store with the given settings.
    pub fn with_config(config: &SnapshotStoreConfig) -> Result<Self> {
        Ok(Self {
            codec: config.codec()?,
            retain_count: config.retain_count(),
            ..Self::default()
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Total snapshots held across all aggregates.
    pub async fn len(&self) -> usize {
        self.records.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    #[tracing::instrument(skip(self, snapshot), fields(aggregate_id = %snapshot.aggregate_id, version = %snapshot.version))]
    async fn save(&self, snapshot: AggregateSnapshot) -> Result<Vec<Version>> {
        let record = self.codec.encode(&snapshot)?;

        let mut records = self.records.write().await;
        let versions = records.entry(snapshot.aggregate_id).or_default();
        versions.insert(record.version, record);

        let mut pruned = Vec::new();
        while versions.len() > self.retain_count {
            if let Some((version, _)) = versions.pop_first() {
                pruned.push(version);
            }
        }
        drop(records);

        metrics::counter!("snapshots_saved_total").increment(1);
        if !pruned.is_empty() {
            metrics::counter!("snapshots_pruned_total").increment(pruned.len() as u64);
            tracing::debug!(pruned = pruned.len(), "old snapshots pruned");
        }
        Ok(pruned)
    }

    async fn load(&self, aggregate_id: AggregateId) -> Result<Option<AggregateSnapshot>> {
        let record = self
            .records
            .read()
            .await
            .get(&aggregate_id)
            .and_then(|versions| versions.last_key_value())
            .map(|(_, record)| record.clone());
        record.map(|r| self.codec.decode(r)).transpose()
    }

    async fn load_version(
        &self,
        aggregate_id: AggregateId,
        version: Version,
    ) -> Result<Option<AggregateSnapshot>> {
        let record = self
            .records
            .read()
            .await
            .get(&aggregate_id)
            .and_then(|versions| versions.get(&version))
            .cloned();
        record.map(|r| self.codec.decode(r)).transpose()
    }

    async fn versions(&self, aggregate_id: AggregateId) -> Result<Vec<Version>> {
        Ok(self
            .records
            .read()
            .await
            .get(&aggregate_id)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn remove_all(&self, aggregate_id: AggregateId) -> Result<usize> {
        Ok(self
            .records
            .write()
            .await
            .remove(&aggregate_id)
            .map(|versions| versions.len())
            .unwrap_or(0))
    }

    async fn archive_old_snapshots(
        &self,
        older_than_days: u32,
    ) -> Result<Vec<(AggregateId, Version)>> {
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(older_than_days));
        let mut records = self.records.write().await;
        let mut removed = Vec::new();

        for (aggregate_id, versions) in records.iter_mut() {
            let Some(newest) = versions.keys().next_back().copied() else {
                continue;
            };
            versions.retain(|version, record| {
                let keep = *version == newest || record.created_at >= cutoff;
                if !keep {
                    removed.push((*aggregate_id, *version));
                }
                keep
            });
        }

        Ok(removed)
    }

    async fn verify_integrity(&self) -> Result<Vec<CorruptSnapshot>> {
        let records: Vec<SnapshotRecord> = self
            .records
            .read()
            .await
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect();

        let mut corrupt = Vec::new();
        for record in records {
            let (aggregate_id, version, stored_hash) =
                (record.aggregate_id, record.version, record.hash.clone());
            match self.codec.decode(record) {
                Ok(snapshot) => corrupt.extend(check_integrity(&snapshot)),
                Err(e) => {
                    tracing::warn!(%aggregate_id, %version, error = %e, "snapshot undecodable");
                    corrupt.push(CorruptSnapshot {
                        aggregate_id,
                        version,
                        stored_hash,
                        computed_hash: None,
                    });
                }
            }
        }
        Ok(corrupt)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use common::ManualClock;

    use super::*;
    use crate::compression::CompressionMethod;

    fn snapshot(id: AggregateId, version: i64) -> AggregateSnapshot {
        AggregateSnapshot::new(
            id,
            "Account",
            Version::new(version),
            serde_json::json!({"balance": version * 100}),
        )
    }

    #[tokio::test]
    async fn save_and_load_latest() {
        let store = InMemorySnapshotStore::new();
        let id = AggregateId::new();

        store.save(snapshot(id, 5)).await.unwrap();
        store.save(snapshot(id, 10)).await.unwrap();

        let latest = store.load(id).await.unwrap().unwrap();
        assert_eq!(latest.version, Version::new(10));
        assert_eq!(latest.state, serde_json::json!({"balance": 1000}));

        let older = store.load_version(id, Version::new(5)).await.unwrap();
        assert_eq!(older.unwrap().version, Version::new(5));
        assert!(store.load_version(id, Version::new(7)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_aggregate_has_no_snapshot() {
        let store = InMemorySnapshotStore::new();
        let id = AggregateId::new();

        assert!(store.load(id).await.unwrap().is_none());
        assert!(!store.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn pruning_keeps_newest_retain_count() {
        let store = InMemorySnapshotStore::new();
        let id = AggregateId::new();
        let mut all_pruned = Vec::new();

        for v in 1..=7 {
            all_pruned.extend(store.save(snapshot(id, v * 10)).await.unwrap());
        }

        assert_eq!(
            store.versions(id).await.unwrap(),
            vec![Version::new(50), Version::new(60), Version::new(70)]
        );
        assert_eq!(
            all_pruned,
            vec![Version::new(10), Version::new(20), Version::new(30), Version::new(40)]
        );
    }

    #[tokio::test]
    async fn resaving_a_version_upserts() {
        let store = InMemorySnapshotStore::new();
        let id = AggregateId::new();
        store.save(snapshot(id, 3)).await.unwrap();

        let replacement = AggregateSnapshot::new(id, "Account", Version::new(3), serde_json::json!({"balance": 1}));
        store.save(replacement.clone()).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.load(id).await.unwrap().unwrap(), replacement);
    }

    #[tokio::test]
    async fn verify_integrity_flags_tampered_state() {
        let store = InMemorySnapshotStore::new();
        let clean = AggregateId::new();
        let tampered = AggregateId::new();
        store.save(snapshot(clean, 1)).await.unwrap();
        store.save(snapshot(tampered, 2)).await.unwrap();
        assert!(store.verify_integrity().await.unwrap().is_empty());

        {
            let mut records = store.records.write().await;
            let record = records
                .get_mut(&tampered)
                .and_then(|v| v.get_mut(&Version::new(2)))
                .unwrap();
            // {"balance":200} -> {"balance":900}
            let pos = record.state.iter().position(|b| *b == b'2').unwrap();
            record.state[pos] = b'9';
        }

        let corrupt = store.verify_integrity().await.unwrap();
        assert_eq!(corrupt.len(), 1);
        assert_eq!(corrupt[0].aggregate_id, tampered);
        assert_eq!(corrupt[0].version, Version::new(2));
        assert!(corrupt[0].computed_hash.is_some());
    }

    #[tokio::test]
    async fn undecodable_state_is_reported_not_raised() {
        let store = InMemorySnapshotStore::new();
        let id = AggregateId::new();
        store.save(snapshot(id, 1)).await.unwrap();

        {
            let mut records = store.records.write().await;
            let record = records.get_mut(&id).and_then(|v| v.get_mut(&Version::new(1))).unwrap();
            record.state = b"\x00garbage".to_vec();
        }

        let corrupt = store.verify_integrity().await.unwrap();
        assert_eq!(corrupt.len(), 1);
        assert!(corrupt[0].computed_hash.is_none());
    }

    #[tokio::test]
    async fn archive_old_snapshots_keeps_newest() {
        let clock = ManualClock::default();
        let config = SnapshotStoreConfig {
            retain_count: 10,
            ..Default::default()
        };
        let store = InMemorySnapshotStore::with_config(&config)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        let id = AggregateId::new();
        let created = clock.now();

        for v in 1..=3 {
            let s = AggregateSnapshot::taken_at(
                id,
                "Account",
                Version::new(v),
                serde_json::json!({}),
                created,
            );
            store.save(s).await.unwrap();
        }
        clock.advance(Duration::days(31));

        let removed = store.archive_old_snapshots(30).await.unwrap();

        assert_eq!(
            removed,
            vec![(id, Version::new(1)), (id, Version::new(2))]
        );
        assert_eq!(store.versions(id).await.unwrap(), vec![Version::new(3)]);
    }

    #[tokio::test]
    async fn load_batch_isolates_missing() {
        let store = InMemorySnapshotStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        store.save(snapshot(a, 4)).await.unwrap();

        let batch = store.load_batch(&[a, b]).await;

        assert_eq!(batch.len(), 2);
        assert!(batch[&a].as_ref().unwrap().is_some());
        assert!(batch[&b].as_ref().unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_all_clears_lineage() {
        let store = InMemorySnapshotStore::new();
        let id = AggregateId::new();
        store.save(snapshot(id, 1)).await.unwrap();
        store.save(snapshot(id, 2)).await.unwrap();

        assert_eq!(store.remove_all(id).await.unwrap(), 2);
        assert!(!store.exists(id).await.unwrap());
    }

    #[test]
    fn unsupported_configuration_fails_at_construction() {
        let config = SnapshotStoreConfig {
            compression: CompressionMethod::Gzip,
            compression_level: Some(42),
            ..Default::default()
        };
        assert!(InMemorySnapshotStore::with_config(&config).is_err());
    }
}
