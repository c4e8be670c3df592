use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;

use crate::{
    AggregateId, EventEnvelope, EventId, EventQuery, EventStoreError, Result, Version, VersionRange,
};

/// Options for appending events to the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected version of the aggregate for optimistic concurrency control.
    /// If None, no version check is performed (use with caution).
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the aggregate to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the aggregate to not exist (new aggregate).
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// Per-key results of a batch operation. One failing key never affects another.
pub type BatchResult<T> = HashMap<AggregateId, Result<T>>;

/// Core trait for event store implementations.
///
/// An event store is an append-only log of events keyed by aggregate and
/// version. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events to an aggregate's stream.
    ///
    /// The batch is ordered by the store's sequencer and renumbered to
    /// `current + 1 ..`. Events are appended atomically: either all succeed
    /// or none do. If `options.expected_version` is set and differs from the
    /// current version, fails with `ConcurrencyConflict`.
    ///
    /// Returns the new version of the aggregate after appending.
    async fn append(
        &self,
        aggregate_id: AggregateId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Version>;

    /// Loads an aggregate's events in ascending version order.
    async fn load(&self, aggregate_id: AggregateId, range: VersionRange)
    -> Result<Vec<EventEnvelope>>;

    /// Gets the current version of an aggregate, `Version::initial()` if it never had events.
    ///
    /// Versions of events that were archived away still count.
    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Version>;

    /// Retrieves events of one type across all aggregates, oldest first.
    ///
    /// Used for replays that span aggregates.
    async fn load_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>>;

    /// Retrieves events matching a query.
    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>>;

    /// Loads several streams concurrently; a missing aggregate yields an empty stream.
    async fn load_batch(&self, aggregate_ids: &[AggregateId]) -> BatchResult<Vec<EventEnvelope>> {
        let loads = aggregate_ids
            .iter()
            .map(|id| async move { (*id, self.load(*id, VersionRange::all()).await) });
        join_all(loads).await.into_iter().collect()
    }

    /// Reads several aggregate versions concurrently.
    async fn get_versions_batch(&self, aggregate_ids: &[AggregateId]) -> BatchResult<Version> {
        let reads = aggregate_ids
            .iter()
            .map(|id| async move { (*id, self.get_aggregate_version(*id).await) });
        join_all(reads).await.into_iter().collect()
    }

    /// Checks several aggregates for existence concurrently.
    async fn exists_batch(&self, aggregate_ids: &[AggregateId]) -> BatchResult<bool> {
        self.get_versions_batch(aggregate_ids)
            .await
            .into_iter()
            .map(|(id, version)| (id, version.map(|v| v > Version::initial())))
            .collect()
    }
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Appends a single event to the store.
    async fn append_event(&self, event: EventEnvelope, options: AppendOptions) -> Result<Version> {
        self.append(event.aggregate_id, vec![event], options).await
    }

    /// Checks if an aggregate exists (has any events).
    async fn aggregate_exists(&self, aggregate_id: AggregateId) -> Result<bool> {
        Ok(self.get_aggregate_version(aggregate_id).await? > Version::initial())
    }

    /// Loads an aggregate's full stream.
    async fn load_all(&self, aggregate_id: AggregateId) -> Result<Vec<EventEnvelope>> {
        self.load(aggregate_id, VersionRange::all()).await
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Size of one storage tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub aggregates: u64,
    pub events: u64,
    pub partitions: u64,
}

/// A time-based chunk of the warm tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    /// Partition name, `events_YYYY_MM`.
    pub name: String,
    /// First instant covered (inclusive).
    pub starts_at: DateTime<Utc>,
    /// First instant after the partition (exclusive).
    pub ends_at: DateTime<Utc>,
    pub event_count: u64,
}

/// Low-latency store for recently active aggregates.
#[async_trait]
pub trait HotTier: EventStore {
    /// Aggregates with no activity since `cutoff`.
    async fn inactive_aggregates(&self, cutoff: DateTime<Utc>, limit: usize)
    -> Result<Vec<AggregateId>>;

    /// Drops an aggregate's stream from this tier. Returns the number of events removed.
    async fn evict(&self, aggregate_id: AggregateId) -> Result<usize>;

    /// Drops the stream only while the aggregate is still at `expected`.
    ///
    /// The comparison and the removal happen under one lock. Returns the
    /// number of events removed, or `None` when the aggregate moved on.
    async fn evict_if_version(
        &self,
        aggregate_id: AggregateId,
        expected: Version,
    ) -> Result<Option<usize>>;

    /// Appends like [`EventStore::append`] and returns the committed envelopes.
    ///
    /// With `resident` set the tier refuses with `Ok(None)` when it holds
    /// nothing for the aggregate, which tells a caller that hydrated the
    /// stream that it was evicted again before the append.
    async fn append_committed(
        &self,
        aggregate_id: AggregateId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
        resident: bool,
    ) -> Result<Option<Vec<EventEnvelope>>>;

    /// Installs the stream fetched from a colder tier.
    ///
    /// `version` is the colder tier's current version, which may be ahead of
    /// the newest event in `events` once older partitions went to cold storage.
    /// No-op if the tier already knows the aggregate.
    async fn hydrate(
        &self,
        aggregate_id: AggregateId,
        version: Version,
        events: Vec<EventEnvelope>,
    ) -> Result<()>;

    /// Current size of the tier.
    async fn hot_stats(&self) -> Result<TierStats>;
}

/// Durable system-of-record store, organised in time partitions.
#[async_trait]
pub trait WarmTier: EventStore {
    /// Inserts events keeping their versions, skipping any that are already
    /// present under the same event id. Returns the number of newly inserted
    /// events.
    ///
    /// Fails with [`EventStoreError::ImportCollision`] and inserts nothing when
    /// a version is already held by a different event.
    async fn import_events(&self, events: Vec<EventEnvelope>) -> Result<usize>;

    /// All non-empty partitions, oldest first.
    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>>;

    /// Every event in a partition.
    async fn load_partition(&self, name: &str) -> Result<Vec<EventEnvelope>>;

    /// Removes the listed events from a partition.
    ///
    /// Events imported into the partition after it was read are left in
    /// place. The aggregate's version is unaffected. Returns the number of
    /// events removed.
    async fn drop_partition(&self, name: &str, archived: &[EventId]) -> Result<u64>;

    /// Current size of the tier.
    async fn warm_stats(&self) -> Result<TierStats>;
}

/// Validates events before appending.
pub fn validate_events_for_append(
    aggregate_id: AggregateId,
    events: &[EventEnvelope],
) -> Result<()> {
    let Some(first) = events.first() else {
        return Ok(());
    };

    for event in events {
        if event.aggregate_id != aggregate_id {
            return Err(EventStoreError::InvalidBatch(format!(
                "event {} belongs to aggregate {}, not {}",
                event.event_id, event.aggregate_id, aggregate_id
            )));
        }
        if event.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::InvalidBatch(
                "All events must have the same aggregate type".to_string(),
            ));
        }
        if event.version < Version::first() {
            return Err(EventStoreError::InvalidBatch(format!(
                "event {} has version {}; versions start at 1",
                event.event_id, event.version
            )));
        }
        if event.event_type.is_empty() {
            return Err(EventStoreError::InvalidBatch(format!(
                "event {} has an empty event type",
                event.event_id
            )));
        }
    }

    Ok(())
}

/// Groups `(aggregate, version)` pairs whose slot holds another event into an
/// [`EventStoreError::ImportCollision`] for the first affected aggregate.
pub fn import_collision(collisions: Vec<(AggregateId, Version)>) -> Result<()> {
    let Some((aggregate_id, _)) = collisions.first().copied() else {
        return Ok(());
    };
    let versions = collisions
        .into_iter()
        .filter(|(id, _)| *id == aggregate_id)
        .map(|(_, version)| version)
        .collect();
    metrics::counter!("event_store_import_collisions_total").increment(1);
    tracing::error!(%aggregate_id, ?versions, "import would replace stored events");
    Err(EventStoreError::ImportCollision {
        aggregate_id,
        versions,
    })
}

/// Renumbers an ordered batch to `current + 1 ..`.
pub fn assign_versions(current: Version, events: Vec<EventEnvelope>) -> Vec<EventEnvelope> {
    events
        .into_iter()
        .enumerate()
        .map(|(i, event)| event.with_version(current.advance(i as i64 + 1)))
        .collect()
}

/// Name of the monthly partition containing `at`.
pub fn partition_name(at: DateTime<Utc>) -> String {
    format!("events_{}", at.format("%Y_%m"))
}

/// Parses a partition name back into its `[start, end)` bounds.
pub fn partition_bounds(name: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    use chrono::{Datelike, NaiveDate, TimeZone};

    let rest = name.strip_prefix("events_")?;
    let (year, month) = rest.split_once('_')?;
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let end = if start.month() == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((
        Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0)?),
        Utc.from_utc_datetime(&end.and_hms_opt(0, 0, 0)?),
    ))
}
