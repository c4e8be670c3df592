use std::time::Duration;

use async_trait::async_trait;

use crate::{
    AggregateId, AggregateSnapshot, CorruptSnapshot, Version,
    cache::CacheBackend,
    error::Result,
    store::SnapshotStore,
};

/// Read-through cache in front of a [`SnapshotStore`].
///
/// Both the latest snapshot and individual versions are cached. Saves refresh
/// the latest entry and evict pruned versions. Cache failures are logged and
/// fall through to the inner store. Archiving old snapshots evicts their
/// version entries; the latest entry stays since the newest snapshot is
/// always kept.
pub struct CachedSnapshotStore<S, C> {
    inner: S,
    cache: C,
    ttl: Duration,
}

impl<S: SnapshotStore, C: CacheBackend> CachedSnapshotStore<S, C> {
    pub fn new(inner: S, cache: C, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    fn latest_key(aggregate_id: AggregateId) -> String {
        format!("snapshot:{aggregate_id}:latest")
    }

    fn version_key(aggregate_id: AggregateId, version: Version) -> String {
        format!("snapshot:{aggregate_id}:v{version}")
    }

    async fn cached(&self, key: &str) -> Option<AggregateSnapshot> {
        match self.cache.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(snapshot) => {
                    metrics::counter!("snapshot_cache_hits_total").increment(1);
                    return Some(snapshot);
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "dropping unreadable cache entry");
                    self.forget(key).await;
                }
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(key, error = %e, "snapshot cache read failed"),
        }
        metrics::counter!("snapshot_cache_misses_total").increment(1);
        None
    }

    async fn remember(&self, key: &str, snapshot: &AggregateSnapshot) {
        let bytes = match serde_json::to_vec(snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key, error = %e, "snapshot not cacheable");
                return;
            }
        };
        if let Err(e) = self.cache.put(key, bytes, Some(self.ttl)).await {
            tracing::warn!(key, error = %e, "snapshot cache write failed");
        }
    }

    async fn forget(&self, key: &str) {
        if let Err(e) = self.cache.forget(key).await {
            tracing::warn!(key, error = %e, "snapshot cache eviction failed");
        }
    }
}

#[async_trait]
impl<S: SnapshotStore, C: CacheBackend> SnapshotStore for CachedSnapshotStore<S, C> {
    async fn save(&self, snapshot: AggregateSnapshot) -> Result<Vec<Version>> {
        let aggregate_id = snapshot.aggregate_id;
        let pruned = self.inner.save(snapshot.clone()).await?;

        self.remember(&Self::version_key(aggregate_id, snapshot.version), &snapshot)
            .await;
        // a re-save of an older version must not replace the latest entry
        match self.inner.load(aggregate_id).await {
            Ok(Some(latest)) => self.remember(&Self::latest_key(aggregate_id), &latest).await,
            _ => self.forget(&Self::latest_key(aggregate_id)).await,
        }
        for version in &pruned {
            self.forget(&Self::version_key(aggregate_id, *version)).await;
        }

        Ok(pruned)
    }

    async fn load(&self, aggregate_id: AggregateId) -> Result<Option<AggregateSnapshot>> {
        let key = Self::latest_key(aggregate_id);
        if let Some(snapshot) = self.cached(&key).await {
            return Ok(Some(snapshot));
        }
        let snapshot = self.inner.load(aggregate_id).await?;
        if let Some(ref snapshot) = snapshot {
            self.remember(&key, snapshot).await;
        }
        Ok(snapshot)
    }

    async fn load_version(
        &self,
        aggregate_id: AggregateId,
        version: Version,
    ) -> Result<Option<AggregateSnapshot>> {
        let key = Self::version_key(aggregate_id, version);
        if let Some(snapshot) = self.cached(&key).await {
            return Ok(Some(snapshot));
        }
        let snapshot = self.inner.load_version(aggregate_id, version).await?;
        if let Some(ref snapshot) = snapshot {
            self.remember(&key, snapshot).await;
        }
        Ok(snapshot)
    }

    async fn versions(&self, aggregate_id: AggregateId) -> Result<Vec<Version>> {
        self.inner.versions(aggregate_id).await
    }

    async fn remove_all(&self, aggregate_id: AggregateId) -> Result<usize> {
        let versions = self.inner.versions(aggregate_id).await?;
        let removed = self.inner.remove_all(aggregate_id).await?;

        self.forget(&Self::latest_key(aggregate_id)).await;
        for version in versions {
            self.forget(&Self::version_key(aggregate_id, version)).await;
        }
        Ok(removed)
    }

    async fn archive_old_snapshots(
        &self,
        older_than_days: u32,
    ) -> Result<Vec<(AggregateId, Version)>> {
        let removed = self.inner.archive_old_snapshots(older_than_days).await?;
        for (aggregate_id, version) in &removed {
            self.forget(&Self::version_key(*aggregate_id, *version)).await;
        }
        Ok(removed)
    }

    async fn verify_integrity(&self) -> Result<Vec<CorruptSnapshot>> {
        self.inner.verify_integrity().await
    }

    async fn exists(&self, aggregate_id: AggregateId) -> Result<bool> {
        Ok(self.load(aggregate_id).await?.is_some())
    }
}
