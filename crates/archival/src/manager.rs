use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use common::{Clock, SystemClock};
use event_store::{
    AggregateId, EventEnvelope, EventId, HotTier, TierStats, Version, VersionRange, WarmTier,
};
use serde::{Deserialize, Serialize};
use snapshot_store::{CompressionMethod, SnapshotCompression};

use crate::{
    cold::ColdStorage,
    error::{ArchivalError, Result},
    layout::{
        AGGREGATES_PREFIX, ArchiveChunk, ManifestEntry, PARTITIONS_PREFIX, PartitionManifest,
        aggregate_prefix, chunk_path, decode_chunk, encode_chunk, manifest_path, method_for,
    },
};

/// Archival policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchivalConfig {
    /// Hot aggregates idle for longer than this move to warm.
    pub hot_retention_hours: u32,
    /// Warm partitions that ended longer ago than this move to cold.
    pub warm_retention_days: u32,
    /// Most aggregates or partitions handled per call.
    pub batch_limit: usize,
    pub compression: CompressionMethod,
    /// `None` uses the method's default level.
    pub compression_level: Option<i32>,
    /// Restores older than this no longer count towards migration.
    pub access_window_hours: u32,
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self {
            hot_retention_hours: 24,
            warm_retention_days: 90,
            batch_limit: 100,
            compression: CompressionMethod::Gzip,
            compression_level: None,
            access_window_hours: 24 * 7,
        }
    }
}

/// Outcome of one hot or warm archival pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchivalRunReport {
    /// Aggregates or partitions looked at.
    pub processed: usize,
    /// Aggregates or partitions moved down a tier.
    pub archived: usize,
    /// Aggregates left in place because they changed during the pass.
    pub skipped: usize,
    pub failures: usize,
    pub events: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
    /// Archives written with a codec this build lacks; left untouched.
    pub skipped: usize,
    pub failures: usize,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub candidates: usize,
    pub migrated: usize,
    pub failures: usize,
    pub events: u64,
}

/// What one partition pass moved, and how many aggregates it had to leave behind.
#[derive(Debug, Default)]
struct PartitionOutcome {
    events: u64,
    failures: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ColdStats {
    pub chunks: u64,
    pub bytes: u64,
    pub partitions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord<R> {
    pub finished_at: DateTime<Utc>,
    pub report: R,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivalStatistics {
    pub hot: TierStats,
    pub warm: TierStats,
    pub cold: ColdStats,
    /// Aggregates restored from cold since their last migration.
    pub tracked_aggregates: usize,
    pub last_hot_run: Option<RunRecord<ArchivalRunReport>>,
    pub last_warm_run: Option<RunRecord<ArchivalRunReport>>,
    pub last_cleanup: Option<RunRecord<CleanupReport>>,
}

const ACCESS_SWEEP_EVERY: u32 = 256;

#[derive(Debug, Clone, Copy)]
struct AccessRecord {
    count: u64,
    last_at: DateTime<Utc>,
}

/// Restore counts per aggregate, limited to a sliding window.
#[derive(Debug, Default)]
struct AccessLog {
    records: HashMap<AggregateId, AccessRecord>,
    since_sweep: u32,
}

impl AccessLog {
    fn record(&mut self, aggregate_id: AggregateId, now: DateTime<Utc>, horizon: DateTime<Utc>) {
        self.since_sweep += 1;
        if self.since_sweep >= ACCESS_SWEEP_EVERY {
            self.prune(horizon);
        }
        let record = self.records.entry(aggregate_id).or_insert(AccessRecord {
            count: 0,
            last_at: now,
        });
        record.count += 1;
        record.last_at = now;
    }

    fn prune(&mut self, horizon: DateTime<Utc>) {
        self.since_sweep = 0;
        self.records.retain(|_, r| r.last_at >= horizon);
    }
}

#[derive(Debug, Default)]
struct RunHistory {
    hot: Option<RunRecord<ArchivalRunReport>>,
    warm: Option<RunRecord<ArchivalRunReport>>,
    cleanup: Option<RunRecord<CleanupReport>>,
}

/// Moves events hot → warm → cold and back.
///
/// Every move writes the destination first and only removes the source once
/// the write is confirmed, so an interrupted pass can simply be run again.
/// Batch operations isolate per-item failures into their report.
pub struct EventArchivalManager {
    hot: Arc<dyn HotTier>,
    warm: Arc<dyn WarmTier>,
    cold: Arc<dyn ColdStorage>,
    config: ArchivalConfig,
    codec: SnapshotCompression,
    clock: Arc<dyn Clock>,
    access: Mutex<AccessLog>,
    history: Mutex<RunHistory>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl EventArchivalManager {
    pub fn new(
        hot: Arc<dyn HotTier>,
        warm: Arc<dyn WarmTier>,
        cold: Arc<dyn ColdStorage>,
        config: ArchivalConfig,
    ) -> Result<Self> {
        let level = config
            .compression_level
            .unwrap_or_else(|| config.compression.default_level());
        let codec = SnapshotCompression::new(config.compression, level)?;
        Ok(Self {
            hot,
            warm,
            cold,
            config,
            codec,
            clock: Arc::new(SystemClock),
            access: Mutex::new(AccessLog::default()),
            history: Mutex::new(RunHistory::default()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ArchivalConfig {
        &self.config
    }

    /// Times the aggregate was restored since it was last migrated, within
    /// the access window.
    pub fn access_count(&self, aggregate_id: AggregateId) -> u64 {
        let horizon = self.access_horizon();
        lock(&self.access)
            .records
            .get(&aggregate_id)
            .filter(|r| r.last_at >= horizon)
            .map(|r| r.count)
            .unwrap_or(0)
    }

    fn access_horizon(&self) -> DateTime<Utc> {
        self.clock.now() - Duration::hours(i64::from(self.config.access_window_hours))
    }

    /// Moves aggregates idle for `older_than_hours` from hot to warm.
    ///
    /// Each aggregate's full stream is imported into warm; it is evicted from
    /// hot only once warm holds at least the hot version, and only if hot is
    /// still at the version that was imported.
    #[tracing::instrument(skip(self))]
    pub async fn archive_hot_events(&self, older_than_hours: u32) -> Result<ArchivalRunReport> {
        let started = Instant::now();
        let cutoff = self.clock.now() - Duration::hours(i64::from(older_than_hours));
        let idle = self
            .hot
            .inactive_aggregates(cutoff, self.config.batch_limit)
            .await?;

        let mut report = ArchivalRunReport::default();
        for aggregate_id in idle {
            report.processed += 1;
            match self.archive_hot_aggregate(aggregate_id).await {
                Ok(Some(events)) => {
                    report.archived += 1;
                    report.events += events;
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failures += 1;
                    metrics::counter!("archival_failures_total", "operation" => "hot").increment(1);
                    tracing::warn!(%aggregate_id, error = %e, "hot archival failed");
                }
            }
        }

        report.duration_ms = finish("hot", started);
        metrics::counter!("archival_events_archived_total", "tier" => "warm").increment(report.events);
        tracing::info!(
            archived = report.archived,
            failures = report.failures,
            events = report.events,
            "hot archival finished"
        );
        lock(&self.history).hot = Some(RunRecord {
            finished_at: self.clock.now(),
            report: report.clone(),
        });
        Ok(report)
    }

    /// Returns the number of events moved, or `None` if the aggregate was
    /// written to while being archived.
    async fn archive_hot_aggregate(&self, aggregate_id: AggregateId) -> Result<Option<u64>> {
        let events = self.hot.load(aggregate_id, VersionRange::all()).await?;
        let Some(hot_version) = events.last().map(|e| e.version) else {
            let version = self.hot.get_aggregate_version(aggregate_id).await?;
            return Ok(self
                .hot
                .evict_if_version(aggregate_id, version)
                .await?
                .map(|_| 0));
        };
        let count = events.len() as u64;

        self.warm.import_events(events).await?;
        let warm_version = self.warm.get_aggregate_version(aggregate_id).await?;
        if warm_version < hot_version {
            return Err(ArchivalError::WarmBehind {
                aggregate_id,
                hot_version,
                warm_version,
            });
        }

        match self.hot.evict_if_version(aggregate_id, hot_version).await? {
            Some(_) => Ok(Some(count)),
            None => {
                tracing::debug!(%aggregate_id, "aggregate changed during archival");
                Ok(None)
            }
        }
    }

    /// Moves warm partitions that ended more than `older_than_days` ago to cold.
    ///
    /// A partition is dropped from warm only after every chunk and its
    /// manifest have been written.
    #[tracing::instrument(skip(self))]
    pub async fn archive_warm_events(&self, older_than_days: u32) -> Result<ArchivalRunReport> {
        let started = Instant::now();
        let cutoff = self.clock.now() - Duration::days(i64::from(older_than_days));
        let expired: Vec<_> = self
            .warm
            .list_partitions()
            .await?
            .into_iter()
            .filter(|p| p.ends_at <= cutoff)
            .take(self.config.batch_limit)
            .collect();

        let mut report = ArchivalRunReport::default();
        for partition in expired {
            report.processed += 1;
            match self.archive_partition(&partition.name).await {
                Ok(outcome) => {
                    if outcome.failures == 0 {
                        report.archived += 1;
                    }
                    report.failures += outcome.failures;
                    report.events += outcome.events;
                }
                Err(e) => {
                    report.failures += 1;
                    metrics::counter!("archival_failures_total", "operation" => "warm").increment(1);
                    tracing::warn!(partition = %partition.name, error = %e, "warm archival failed");
                }
            }
        }

        report.duration_ms = finish("warm", started);
        metrics::counter!("archival_events_archived_total", "tier" => "cold").increment(report.events);
        tracing::info!(
            archived = report.archived,
            failures = report.failures,
            events = report.events,
            "warm archival finished"
        );
        lock(&self.history).warm = Some(RunRecord {
            finished_at: self.clock.now(),
            report: report.clone(),
        });
        Ok(report)
    }

    async fn archive_partition(&self, partition: &str) -> Result<PartitionOutcome> {
        let mut groups: BTreeMap<AggregateId, Vec<EventEnvelope>> = BTreeMap::new();
        for event in self.warm.load_partition(partition).await? {
            groups.entry(event.aggregate_id).or_default().push(event);
        }

        let archived_at = self.clock.now();
        let mut outcome = PartitionOutcome::default();
        let mut archived: Vec<EventId> = Vec::new();
        let mut entries = Vec::with_capacity(groups.len());
        for (aggregate_id, events) in groups {
            let ids: Vec<EventId> = events.iter().map(|e| e.event_id).collect();
            match self.write_chunk(aggregate_id, partition, archived_at, events).await {
                Ok(entry) => {
                    archived.extend(ids);
                    entries.push(entry);
                }
                Err(e) => {
                    outcome.failures += 1;
                    metrics::counter!("archival_failures_total", "operation" => "warm").increment(1);
                    tracing::warn!(%aggregate_id, partition, error = %e, "aggregate kept in warm");
                }
            }
        }

        let manifest = self.merged_manifest(partition, archived_at, entries).await?;
        self.cold
            .put(&manifest_path(partition), serde_json::to_vec_pretty(&manifest)?)
            .await?;

        outcome.events = archived.len() as u64;
        let dropped = self.warm.drop_partition(partition, &archived).await?;
        if dropped < outcome.events {
            tracing::warn!(partition, written = outcome.events, dropped, "partition shrank while archiving");
        }
        tracing::debug!(partition, dropped, chunks = manifest.chunks.len(), "partition archived");
        Ok(outcome)
    }

    /// Writes one aggregate's share of a partition, merged with any chunk an
    /// earlier pass over the same partition left behind.
    async fn write_chunk(
        &self,
        aggregate_id: AggregateId,
        partition: &str,
        archived_at: DateTime<Utc>,
        mut events: Vec<EventEnvelope>,
    ) -> Result<ManifestEntry> {
        let path = chunk_path(aggregate_id, partition, self.codec.method());
        events.extend(self.previous_chunk_events(&path).await?);
        events.sort_by_key(|e| e.version);
        events.dedup_by_key(|e| e.version);
        let chunk = ArchiveChunk {
            aggregate_id,
            partition: partition.to_string(),
            archived_at,
            events,
        };
        let data = encode_chunk(&chunk, &self.codec)?;
        let bytes = data.len() as u64;
        self.cold.put(&path, data).await?;
        Ok(ManifestEntry {
            aggregate_id,
            path,
            events: chunk.events.len() as u64,
            bytes,
        })
    }

    /// Events already archived at `path` by an earlier pass over the same
    /// partition. An unreadable chunk is an error so it is never overwritten.
    async fn previous_chunk_events(&self, path: &str) -> Result<Vec<EventEnvelope>> {
        match self.cold.get(path).await? {
            Some(data) => Ok(decode_chunk(path, &data, &self.codec)?.events),
            None => Ok(Vec::new()),
        }
    }

    /// A partition can be archived more than once when migrated aggregates
    /// fall back into it; earlier manifest entries for other aggregates stay.
    async fn merged_manifest(
        &self,
        partition: &str,
        archived_at: DateTime<Utc>,
        entries: Vec<ManifestEntry>,
    ) -> Result<PartitionManifest> {
        let mut chunks: BTreeMap<AggregateId, ManifestEntry> = BTreeMap::new();
        if let Some(data) = self.cold.get(&manifest_path(partition)).await? {
            match serde_json::from_slice::<PartitionManifest>(&data) {
                Ok(previous) => {
                    for entry in previous.chunks {
                        if self.cold.exists(&entry.path).await? {
                            chunks.insert(entry.aggregate_id, entry);
                        }
                    }
                }
                Err(e) => tracing::warn!(partition, error = %e, "replacing unreadable manifest"),
            }
        }
        chunks.extend(entries.into_iter().map(|e| (e.aggregate_id, e)));

        let chunks: Vec<_> = chunks.into_values().collect();
        Ok(PartitionManifest {
            partition: partition.to_string(),
            archived_at,
            compression: self.codec.method(),
            event_count: entries_events(&chunks),
            chunks,
        })
    }

    /// Reads an aggregate's archived events, optionally bounded by version.
    ///
    /// An aggregate with no archive yields an empty list; an archive that
    /// cannot be decoded is an error. Each call that finds an archive counts
    /// towards [`EventArchivalManager::migrate_frequently_accessed`].
    #[tracing::instrument(skip(self))]
    pub async fn restore_from_cold(
        &self,
        aggregate_id: AggregateId,
        from: Option<Version>,
        to: Option<Version>,
    ) -> Result<Vec<EventEnvelope>> {
        let (events, _) = self.read_cold(aggregate_id).await?;
        if !events.is_empty() {
            let horizon = self.access_horizon();
            lock(&self.access).record(aggregate_id, self.clock.now(), horizon);
        }

        let range = VersionRange::between(from, to);
        Ok(events
            .into_iter()
            .filter(|e| range.contains(e.version))
            .collect())
    }

    async fn read_cold(&self, aggregate_id: AggregateId) -> Result<(Vec<EventEnvelope>, Vec<String>)> {
        let paths = self.cold.list(&aggregate_prefix(aggregate_id)).await?;
        let mut events = Vec::new();
        let mut found = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(data) = self.cold.get(&path).await? else {
                continue;
            };
            events.extend(decode_chunk(&path, &data, &self.codec)?.events);
            found.push(path);
        }
        events.sort_by_key(|e| e.version);
        events.dedup_by_key(|e| e.version);
        Ok((events, found))
    }

    /// Moves an aggregate's archive back into warm. Returns the number of
    /// events restored.
    ///
    /// Fails with [`ArchivalError::VersionCollision`] and keeps the archive
    /// when warm already holds different events under archived versions.
    #[tracing::instrument(skip(self))]
    pub async fn migrate_to_warm(&self, aggregate_id: AggregateId) -> Result<u64> {
        let (events, paths) = self.read_cold(aggregate_id).await?;
        let Some(newest) = events.last().map(|e| e.version) else {
            return Ok(0);
        };
        let count = events.len() as u64;
        let oldest = events[0].version;
        let archived: HashMap<Version, EventId> =
            events.iter().map(|e| (e.version, e.event_id)).collect();

        let archived_range = VersionRange::between(Some(oldest), Some(newest));
        let collisions = self.colliding_versions(aggregate_id, archived_range, &archived).await?;
        if !collisions.is_empty() {
            metrics::counter!("archival_version_collisions_total").increment(1);
            tracing::error!(%aggregate_id, versions = ?collisions, "warm holds other events at archived versions");
            return Err(ArchivalError::VersionCollision {
                aggregate_id,
                versions: collisions,
            });
        }

        self.warm.import_events(events).await?;
        let warm_version = self.warm.get_aggregate_version(aggregate_id).await?;
        let in_warm = self.warm.load(aggregate_id, archived_range).await?;
        let restored = in_warm
            .iter()
            .filter(|e| archived.get(&e.version) == Some(&e.event_id))
            .count();
        if warm_version < newest || restored < archived.len() {
            return Err(ArchivalError::WarmBehind {
                aggregate_id,
                hot_version: newest,
                warm_version,
            });
        }

        for path in &paths {
            self.cold.delete(path).await?;
        }
        lock(&self.access).records.remove(&aggregate_id);
        metrics::counter!("archival_events_migrated_total").increment(count);
        tracing::info!(%aggregate_id, events = count, "aggregate migrated to warm");
        Ok(count)
    }

    /// Versions in `range` where warm holds an event other than the archived one.
    async fn colliding_versions(
        &self,
        aggregate_id: AggregateId,
        range: VersionRange,
        archived: &HashMap<Version, EventId>,
    ) -> Result<Vec<Version>> {
        Ok(self
            .warm
            .load(aggregate_id, range)
            .await?
            .iter()
            .filter(|e| archived.get(&e.version).is_some_and(|id| *id != e.event_id))
            .map(|e| e.version)
            .collect())
    }

    /// Migrates aggregates restored at least `min_accesses` times, busiest first.
    #[tracing::instrument(skip(self))]
    pub async fn migrate_frequently_accessed(&self, min_accesses: u64) -> Result<MigrationReport> {
        let horizon = self.access_horizon();
        let mut candidates: Vec<(u64, AggregateId)> = {
            let mut access = lock(&self.access);
            access.prune(horizon);
            access
                .records
                .iter()
                .filter(|(_, r)| r.count >= min_accesses)
                .map(|(id, r)| (r.count, *id))
                .collect()
        };
        candidates.sort_by(|a, b| b.cmp(a));
        candidates.truncate(self.config.batch_limit);

        let mut report = MigrationReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        for (_, aggregate_id) in candidates {
            match self.migrate_to_warm(aggregate_id).await {
                Ok(events) => {
                    report.migrated += 1;
                    report.events += events;
                }
                Err(e) => {
                    report.failures += 1;
                    metrics::counter!("archival_failures_total", "operation" => "migrate").increment(1);
                    tracing::warn!(%aggregate_id, error = %e, "migration to warm failed");
                }
            }
        }
        Ok(report)
    }

    /// Deletes archive chunks that no longer decode or hold malformed events.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_corrupted_archives(&self) -> Result<CleanupReport> {
        let started = Instant::now();
        let mut report = CleanupReport::default();

        for path in self.cold.list(AGGREGATES_PREFIX).await? {
            report.scanned += 1;
            if method_for(&path).is_some_and(|m| !m.is_supported()) {
                report.skipped += 1;
                continue;
            }
            let data = match self.cold.get(&path).await {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(%path, error = %e, "archive unreadable");
                    continue;
                }
            };
            let Err(reason) = decode_chunk(&path, &data, &self.codec) else {
                continue;
            };

            tracing::warn!(%path, error = %reason, "removing corrupted archive");
            match self.cold.delete(&path).await {
                Ok(_) => {
                    report.deleted += 1;
                    report.bytes_freed += data.len() as u64;
                }
                Err(e) => {
                    report.failures += 1;
                    metrics::counter!("archival_failures_total", "operation" => "cleanup").increment(1);
                    tracing::error!(%path, error = %e, "failed to remove corrupted archive");
                }
            }
        }

        finish("cleanup", started);
        lock(&self.history).cleanup = Some(RunRecord {
            finished_at: self.clock.now(),
            report: report.clone(),
        });
        Ok(report)
    }

    pub async fn get_archival_statistics(&self) -> Result<ArchivalStatistics> {
        let hot = self.hot.hot_stats().await?;
        let warm = self.warm.warm_stats().await?;

        let mut cold = ColdStats::default();
        for path in self.cold.list(AGGREGATES_PREFIX).await? {
            cold.chunks += 1;
            cold.bytes += self.cold.size(&path).await?.unwrap_or(0);
        }
        cold.partitions = self.cold.list(PARTITIONS_PREFIX).await?.len() as u64;

        let horizon = self.access_horizon();
        let tracked_aggregates = {
            let mut access = lock(&self.access);
            access.prune(horizon);
            access.records.len()
        };
        let history = lock(&self.history);
        Ok(ArchivalStatistics {
            hot,
            warm,
            cold,
            tracked_aggregates,
            last_hot_run: history.hot.clone(),
            last_warm_run: history.warm.clone(),
            last_cleanup: history.cleanup.clone(),
        })
    }
}

fn entries_events(entries: &[ManifestEntry]) -> u64 {
    entries.iter().map(|e| e.events).sum()
}

fn finish(operation: &'static str, started: Instant) -> u64 {
    let elapsed = started.elapsed();
    metrics::histogram!("archival_run_duration_seconds", "operation" => operation)
        .record(elapsed.as_secs_f64());
    elapsed.as_millis() as u64
}
