use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, SystemClock};
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventId, EventQuery, EventSequencer, EventStoreError, Result,
    Version, VersionRange,
    store::{
        AppendOptions, EventStore, HotTier, PartitionInfo, TierStats, WarmTier, assign_versions,
        import_collision, partition_bounds, partition_name, validate_events_for_append,
    },
};

/// One aggregate's stream plus the last time it was touched.
#[derive(Debug)]
struct StreamEntry {
    events: Vec<EventEnvelope>,
    /// Highest version ever held, kept when events are dropped.
    high_water: Version,
    last_activity_ms: AtomicI64,
}

impl StreamEntry {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            events: Vec::new(),
            high_water: Version::initial(),
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    fn current_version(&self) -> Version {
        self.events
            .last()
            .map(|e| e.version)
            .unwrap_or(Version::initial())
            .max(self.high_water)
    }

    fn touch(&self, now: DateTime<Utc>) {
        self.last_activity_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
    }

    fn last_activity(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }
}

/// In-memory event store.
///
/// Serves as the hot tier in front of a durable warm store, and implements
/// [`WarmTier`] as well so a single process can run the full tiered pipeline
/// without a database. Reads and writes both count as activity for
/// [`HotTier::inactive_aggregates`].
#[derive(Clone)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<HashMap<AggregateId, StreamEntry>>>,
    sequencer: Arc<EventSequencer>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    /// Creates a new empty store with strict ordering.
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            sequencer: Arc::new(EventSequencer::strict()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the sequencer used by `append`.
    pub fn with_sequencer(mut self, sequencer: EventSequencer) -> Self {
        self.sequencer = Arc::new(sequencer);
        self
    }

    /// Replaces the clock used for activity tracking.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn stats(streams: &HashMap<AggregateId, StreamEntry>, partitions: u64) -> TierStats {
        TierStats {
            aggregates: streams.values().filter(|s| !s.events.is_empty()).count() as u64,
            events: streams.values().map(|s| s.events.len() as u64).sum(),
            partitions,
        }
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.streams
            .read()
            .await
            .values()
            .map(|s| s.events.len())
            .sum()
    }

    /// Clears all events.
    pub async fn clear(&self) {
        self.streams.write().await.clear();
    }

    fn version_in(streams: &HashMap<AggregateId, StreamEntry>, aggregate_id: AggregateId) -> Version {
        streams
            .get(&aggregate_id)
            .map(StreamEntry::current_version)
            .unwrap_or(Version::initial())
    }

    /// Checks, sequences and stores a batch inside the caller's write lock.
    fn commit(
        &self,
        streams: &mut HashMap<AggregateId, StreamEntry>,
        aggregate_id: AggregateId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Vec<EventEnvelope>> {
        validate_events_for_append(aggregate_id, &events)?;

        let current_version = Self::version_in(streams, aggregate_id);

        // Check expected version if specified
        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            metrics::counter!("event_store_concurrency_conflicts_total").increment(1);
            tracing::warn!(%aggregate_id, %expected, actual = %current_version, "append rejected");
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual: current_version,
            });
        }

        if events.is_empty() {
            return Ok(Vec::new());
        }

        let ordered = self
            .sequencer
            .order_after(aggregate_id, current_version, events)?;
        let committed = assign_versions(current_version, ordered);

        let now = self.clock.now();
        let entry = streams
            .entry(aggregate_id)
            .or_insert_with(|| StreamEntry::new(now));
        entry.events.extend(committed.iter().cloned());
        entry.touch(now);

        metrics::counter!("event_store_appends_total").increment(1);
        metrics::counter!("event_store_events_appended_total").increment(committed.len() as u64);

        Ok(committed)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        aggregate_id: AggregateId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Version> {
        let mut streams = self.streams.write().await;
        let current = Self::version_in(&streams, aggregate_id);
        let committed = self.commit(&mut streams, aggregate_id, events, options)?;
        Ok(committed.last().map(|e| e.version).unwrap_or(current))
    }

    async fn load(
        &self,
        aggregate_id: AggregateId,
        range: VersionRange,
    ) -> Result<Vec<EventEnvelope>> {
        let streams = self.streams.read().await;
        let Some(entry) = streams.get(&aggregate_id) else {
            return Ok(Vec::new());
        };
        entry.touch(self.clock.now());

        Ok(entry
            .events
            .iter()
            .filter(|e| range.contains(e.version))
            .cloned()
            .collect())
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Version> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(&aggregate_id)
            .map(StreamEntry::current_version)
            .unwrap_or(Version::initial()))
    }

    async fn load_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>> {
        let streams = self.streams.read().await;
        let mut events: Vec<_> = streams
            .values()
            .flat_map(|s| s.events.iter())
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.version.cmp(&b.version))
        });
        Ok(events)
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let streams = self.streams.read().await;
        let mut events: Vec<_> = streams
            .values()
            .flat_map(|s| s.events.iter())
            .filter(|e| query.matches(e))
            .cloned()
            .collect();

        // Sort by timestamp then version
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.version.cmp(&b.version))
        });

        Ok(query.paginate(events))
    }
}

#[async_trait]
impl HotTier for InMemoryEventStore {
    async fn inactive_aggregates(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AggregateId>> {
        let cutoff_ms = cutoff.timestamp_millis();
        let streams = self.streams.read().await;
        let mut idle: Vec<_> = streams
            .iter()
            .filter(|(_, s)| s.last_activity() < cutoff_ms)
            .map(|(id, s)| (s.last_activity(), *id))
            .collect();
        idle.sort();
        Ok(idle.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn evict(&self, aggregate_id: AggregateId) -> Result<usize> {
        let removed = self.streams.write().await.remove(&aggregate_id);
        self.sequencer.reset(aggregate_id);
        Ok(removed.map(|s| s.events.len()).unwrap_or(0))
    }

    async fn evict_if_version(
        &self,
        aggregate_id: AggregateId,
        expected: Version,
    ) -> Result<Option<usize>> {
        let mut streams = self.streams.write().await;
        let current = Self::version_in(&streams, aggregate_id);
        if current != expected {
            tracing::debug!(%aggregate_id, %expected, actual = %current, "eviction skipped");
            return Ok(None);
        }
        let removed = streams.remove(&aggregate_id);
        drop(streams);
        self.sequencer.reset(aggregate_id);
        Ok(Some(removed.map(|s| s.events.len()).unwrap_or(0)))
    }

    async fn append_committed(
        &self,
        aggregate_id: AggregateId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
        resident: bool,
    ) -> Result<Option<Vec<EventEnvelope>>> {
        let mut streams = self.streams.write().await;
        if resident && !streams.contains_key(&aggregate_id) {
            return Ok(None);
        }
        self.commit(&mut streams, aggregate_id, events, options).map(Some)
    }

    async fn hydrate(
        &self,
        aggregate_id: AggregateId,
        version: Version,
        events: Vec<EventEnvelope>,
    ) -> Result<()> {
        if events.is_empty() && version == Version::initial() {
            return Ok(());
        }
        validate_events_for_append(aggregate_id, &events)?;

        let now = self.clock.now();
        let mut streams = self.streams.write().await;
        let entry = streams
            .entry(aggregate_id)
            .or_insert_with(|| StreamEntry::new(now));
        if entry.current_version() == Version::initial() {
            let mut events = events;
            events.sort_by_key(|e| e.version);
            events.dedup_by_key(|e| e.version);
            entry.events = events;
            entry.high_water = version;
        }
        entry.touch(now);
        Ok(())
    }

    async fn hot_stats(&self) -> Result<TierStats> {
        Ok(Self::stats(&*self.streams.read().await, 0))
    }
}

#[async_trait]
impl WarmTier for InMemoryEventStore {
    async fn import_events(&self, events: Vec<EventEnvelope>) -> Result<usize> {
        let now = self.clock.now();
        let mut streams = self.streams.write().await;

        let collisions: Vec<_> = events
            .iter()
            .filter(|event| {
                streams.get(&event.aggregate_id).is_some_and(|entry| {
                    entry
                        .events
                        .binary_search_by_key(&event.version, |e| e.version)
                        .is_ok_and(|pos| entry.events[pos].event_id != event.event_id)
                })
            })
            .map(|e| (e.aggregate_id, e.version))
            .collect();
        import_collision(collisions)?;

        let mut inserted = 0;
        for event in events {
            let entry = streams
                .entry(event.aggregate_id)
                .or_insert_with(|| StreamEntry::new(now));
            if let Err(pos) = entry
                .events
                .binary_search_by_key(&event.version, |e| e.version)
            {
                entry.events.insert(pos, event);
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>> {
        let streams = self.streams.read().await;
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for event in streams.values().flat_map(|s| s.events.iter()) {
            *counts.entry(partition_name(event.timestamp)).or_default() += 1;
        }

        Ok(counts
            .into_iter()
            .filter_map(|(name, event_count)| {
                let (starts_at, ends_at) = partition_bounds(&name)?;
                Some(PartitionInfo {
                    name,
                    starts_at,
                    ends_at,
                    event_count,
                })
            })
            .collect())
    }

    async fn load_partition(&self, name: &str) -> Result<Vec<EventEnvelope>> {
        let streams = self.streams.read().await;
        let mut events: Vec<_> = streams
            .values()
            .flat_map(|s| s.events.iter())
            .filter(|e| partition_name(e.timestamp) == name)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.aggregate_id
                .cmp(&b.aggregate_id)
                .then(a.version.cmp(&b.version))
        });
        Ok(events)
    }

    async fn drop_partition(&self, name: &str, archived: &[EventId]) -> Result<u64> {
        let archived: HashSet<EventId> = archived.iter().copied().collect();
        let mut streams = self.streams.write().await;
        let mut removed = 0u64;
        for entry in streams.values_mut() {
            entry.high_water = entry.current_version();
            let before = entry.events.len();
            entry
                .events
                .retain(|e| !archived.contains(&e.event_id) || partition_name(e.timestamp) != name);
            removed += (before - entry.events.len()) as u64;
        }
        Ok(removed)
    }

    async fn warm_stats(&self) -> Result<TierStats> {
        let partitions = self.list_partitions().await?.len() as u64;
        Ok(Self::stats(&*self.streams.read().await, partitions))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use common::ManualClock;

    use super::*;
    use crate::store::EventStoreExt;

    fn create_test_event(
        aggregate_id: AggregateId,
        version: Version,
        event_type: &str,
    ) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("TestAggregate")
            .event_type(event_type)
            .version(version)
            .payload_raw(serde_json::json!({"test": true}))
            .build()
            .unwrap()
    }

    fn batch(aggregate_id: AggregateId, versions: &[i64]) -> Vec<EventEnvelope> {
        versions
            .iter()
            .map(|v| create_test_event(aggregate_id, Version::new(*v), &format!("Event{v}")))
            .collect()
    }

    #[tokio::test]
    async fn append_single_event() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();
        let event = create_test_event(aggregate_id, Version::first(), "TestEvent");

        let result = store
            .append(aggregate_id, vec![event], AppendOptions::expect_new())
            .await;
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), Version::first());

        let events = store.load_all(aggregate_id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn append_multiple_events() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        let result = store
            .append(aggregate_id, batch(aggregate_id, &[1, 2, 3]), AppendOptions::expect_new())
            .await;
        assert_eq!(result.unwrap(), Version::new(3));

        let stored = store.load_all(aggregate_id).await.unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn versions_are_gapless_after_many_appends() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        for v in 1..=25 {
            store
                .append(
                    aggregate_id,
                    batch(aggregate_id, &[v]),
                    AppendOptions::expect_version(Version::new(v - 1)),
                )
                .await
                .unwrap();
        }

        let events = store.load_all(aggregate_id).await.unwrap();
        let versions: Vec<_> = events.iter().map(|e| e.version.as_i64()).collect();
        assert_eq!(versions, (1..=25).collect::<Vec<_>>());
        assert_eq!(
            store.get_aggregate_version(aggregate_id).await.unwrap(),
            Version::new(25)
        );
    }

    #[tokio::test]
    async fn concurrency_conflict_on_wrong_version() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        store
            .append(aggregate_id, batch(aggregate_id, &[1]), AppendOptions::expect_new())
            .await
            .unwrap();

        // Try to append with wrong expected version
        let result = store
            .append(
                aggregate_id,
                batch(aggregate_id, &[2]),
                AppendOptions::expect_version(Version::initial()),
            )
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_appends_with_same_expected_version_have_one_winner() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();
        store
            .append(aggregate_id, batch(aggregate_id, &[1, 2]), AppendOptions::expect_new())
            .await
            .unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .append(
                            aggregate_id,
                            batch(aggregate_id, &[3, 4]),
                            AppendOptions::expect_version(Version::new(2)),
                        )
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(version) => {
                    winners += 1;
                    assert_eq!(version, Version::new(4));
                }
                Err(e) if e.is_conflict() => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(
            store.get_aggregate_version(aggregate_id).await.unwrap(),
            Version::new(4)
        );
    }

    #[tokio::test]
    async fn strict_store_rejects_gaps_and_inversions() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        let gap = store
            .append(aggregate_id, batch(aggregate_id, &[1, 3]), AppendOptions::new())
            .await;
        let inversion = store
            .append(aggregate_id, batch(aggregate_id, &[1, 3, 2]), AppendOptions::new())
            .await;

        assert!(matches!(gap, Err(EventStoreError::OrderingViolation { .. })));
        assert!(matches!(
            inversion,
            Err(EventStoreError::OrderingViolation { .. })
        ));
        assert!(!store.aggregate_exists(aggregate_id).await.unwrap());
    }

    #[tokio::test]
    async fn relaxed_store_reorders_and_renumbers() {
        let store = InMemoryEventStore::new().with_sequencer(EventSequencer::relaxed(3));
        let aggregate_id = AggregateId::new();

        store
            .append(aggregate_id, batch(aggregate_id, &[3, 1, 2]), AppendOptions::new())
            .await
            .unwrap();
        store
            .append(aggregate_id, batch(aggregate_id, &[6]), AppendOptions::new())
            .await
            .unwrap();

        let events = store.load_all(aggregate_id).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        let versions: Vec<_> = events.iter().map(|e| e.version.as_i64()).collect();
        assert_eq!(types, vec!["Event1", "Event2", "Event3", "Event6"]);
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn load_with_version_window() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();
        store
            .append(aggregate_id, batch(aggregate_id, &[1, 2, 3, 4]), AppendOptions::new())
            .await
            .unwrap();

        let window = store
            .load(
                aggregate_id,
                VersionRange::between(Some(Version::new(2)), Some(Version::new(3))),
            )
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].version, Version::new(2));
        assert_eq!(window[1].version, Version::new(3));
    }

    #[tokio::test]
    async fn load_events_by_type() {
        let store = InMemoryEventStore::new();
        let id1 = AggregateId::new();
        let id2 = AggregateId::new();

        store
            .append(
                id1,
                vec![create_test_event(id1, Version::first(), "AccountOpened")],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        store
            .append(
                id2,
                vec![create_test_event(id2, Version::first(), "AccountClosed")],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        store
            .append(
                id1,
                vec![create_test_event(id1, Version::new(2), "AccountOpened")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        let opened = store.load_events_by_type("AccountOpened").await.unwrap();
        assert_eq!(opened.len(), 2);

        let closed = store.load_events_by_type("AccountClosed").await.unwrap();
        assert_eq!(closed.len(), 1);
    }

    #[tokio::test]
    async fn batch_load_isolates_missing_aggregates() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        let c = AggregateId::new();
        store
            .append(a, batch(a, &[1, 2]), AppendOptions::new())
            .await
            .unwrap();
        store
            .append(c, batch(c, &[1]), AppendOptions::new())
            .await
            .unwrap();

        let streams = store.load_batch(&[a, b, c]).await;
        assert_eq!(streams[&a].as_ref().unwrap().len(), 2);
        assert!(streams[&b].as_ref().unwrap().is_empty());
        assert_eq!(streams[&c].as_ref().unwrap().len(), 1);

        let versions = store.get_versions_batch(&[a, b, c]).await;
        assert_eq!(*versions[&b].as_ref().unwrap(), Version::initial());

        let exists = store.exists_batch(&[a, b]).await;
        assert!(*exists[&a].as_ref().unwrap());
        assert!(!*exists[&b].as_ref().unwrap());
    }

    #[tokio::test]
    async fn query_events_with_filters() {
        let store = InMemoryEventStore::new();
        let id1 = AggregateId::new();
        store
            .append(id1, batch(id1, &[1, 2, 3]), AppendOptions::new())
            .await
            .unwrap();

        // Query with version range
        let query = EventQuery::new()
            .aggregate_id(id1)
            .from_version(Version::new(2))
            .to_version(Version::new(2));

        let results = store.query_events(query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].version, Version::new(2));
    }

    #[tokio::test]
    async fn inactive_aggregates_and_eviction() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let store = InMemoryEventStore::new().with_clock(Arc::new(clock.clone()));
        let idle = AggregateId::new();
        let busy = AggregateId::new();

        store
            .append(idle, batch(idle, &[1]), AppendOptions::new())
            .await
            .unwrap();
        clock.advance(Duration::hours(5));
        store
            .append(busy, batch(busy, &[1]), AppendOptions::new())
            .await
            .unwrap();

        let cutoff = clock.now() - Duration::hours(2);
        let inactive = store.inactive_aggregates(cutoff, 10).await.unwrap();
        assert_eq!(inactive, vec![idle]);

        assert_eq!(store.evict(idle).await.unwrap(), 1);
        assert_eq!(store.evict(idle).await.unwrap(), 0);
        assert_eq!(store.hot_stats().await.unwrap().aggregates, 1);
    }

    #[tokio::test]
    async fn hydrate_only_fills_empty_streams() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let events = assign_versions(Version::initial(), batch(id, &[1, 2, 3]));

        store.hydrate(id, Version::new(3), events.clone()).await.unwrap();
        store.hydrate(id, Version::new(1), events[..1].to_vec()).await.unwrap();

        assert_eq!(store.get_aggregate_version(id).await.unwrap(), Version::new(3));
        assert_eq!(store.load_all(id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn hydrate_without_events_keeps_version_for_appends() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store.hydrate(id, Version::new(5), Vec::new()).await.unwrap();
        let version = store
            .append(id, batch(id, &[6]), AppendOptions::expect_version(Version::new(5)))
            .await
            .unwrap();

        assert_eq!(version, Version::new(6));
        let versions: Vec<_> = store
            .load_all(id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.version.as_i64())
            .collect();
        assert_eq!(versions, vec![6]);
    }

    #[tokio::test]
    async fn import_is_idempotent_and_partitions_follow_timestamps() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let january = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let february = Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap();
        let events = vec![
            create_test_event(id, Version::new(1), "A").with_timestamp(january),
            create_test_event(id, Version::new(2), "B").with_timestamp(february),
        ];

        assert_eq!(store.import_events(events.clone()).await.unwrap(), 2);
        assert_eq!(store.import_events(events).await.unwrap(), 0);

        let partitions = store.list_partitions().await.unwrap();
        let names: Vec<_> = partitions.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["events_2024_01", "events_2024_02"]);

        let archived: Vec<_> = store
            .load_partition("events_2024_01")
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(archived.len(), 1);
        assert_eq!(store.drop_partition("events_2024_01", &archived).await.unwrap(), 1);
        assert_eq!(store.warm_stats().await.unwrap().partitions, 1);
        assert_eq!(store.get_aggregate_version(id).await.unwrap(), Version::new(2));
    }

    #[tokio::test]
    async fn dropping_every_event_keeps_the_version() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let january = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let events: Vec<_> = batch(id, &[1, 2])
            .into_iter()
            .map(|e| e.with_timestamp(january))
            .collect();
        let ids: Vec<_> = events.iter().map(|e| e.event_id).collect();
        store.import_events(events).await.unwrap();

        assert_eq!(store.drop_partition("events_2024_01", &ids).await.unwrap(), 2);

        assert_eq!(store.get_aggregate_version(id).await.unwrap(), Version::new(2));
        assert!(store.load_all(id).await.unwrap().is_empty());
        assert_eq!(store.warm_stats().await.unwrap().aggregates, 0);
        let conflict = store
            .append(id, batch(id, &[1]), AppendOptions::expect_new())
            .await;
        assert!(matches!(
            conflict,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn drop_partition_keeps_events_imported_after_the_read() {
        let store = InMemoryEventStore::new();
        let early = AggregateId::new();
        let late = AggregateId::new();
        let january = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        store
            .import_events(vec![create_test_event(early, Version::new(1), "A").with_timestamp(january)])
            .await
            .unwrap();

        let archived: Vec<_> = store
            .load_partition("events_2024_01")
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_id)
            .collect();
        store
            .import_events(vec![create_test_event(late, Version::new(1), "A").with_timestamp(january)])
            .await
            .unwrap();

        assert_eq!(store.drop_partition("events_2024_01", &archived).await.unwrap(), 1);
        assert_eq!(store.load_all(late).await.unwrap().len(), 1);
        assert!(store.load_all(early).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn eviction_forgets_sequencer_state() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(id, batch(id, &[1]), AppendOptions::new())
            .await
            .unwrap();
        store
            .sequencer
            .enforce_order(id, batch(id, &[1]))
            .unwrap();
        assert_eq!(store.sequencer.tracked_aggregates(), 1);

        store.evict(id).await.unwrap();

        assert_eq!(store.sequencer.tracked_aggregates(), 0);
    }

    #[tokio::test]
    async fn eviction_is_refused_once_the_version_moves() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(id, batch(id, &[1]), AppendOptions::new())
            .await
            .unwrap();
        store
            .append(id, batch(id, &[2]), AppendOptions::expect_version(Version::first()))
            .await
            .unwrap();

        assert_eq!(store.evict_if_version(id, Version::first()).await.unwrap(), None);
        assert_eq!(store.load_all(id).await.unwrap().len(), 2);

        assert_eq!(store.evict_if_version(id, Version::new(2)).await.unwrap(), Some(2));
        assert!(store.load_all(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resident_append_refuses_evicted_aggregates() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        let refused = store
            .append_committed(id, batch(id, &[1]), AppendOptions::new(), true)
            .await
            .unwrap();
        assert!(refused.is_none());
        assert_eq!(store.get_aggregate_version(id).await.unwrap(), Version::initial());

        let committed = store
            .append_committed(id, batch(id, &[1, 2]), AppendOptions::expect_new(), false)
            .await
            .unwrap()
            .unwrap();
        let versions: Vec<_> = committed.iter().map(|e| e.version.as_i64()).collect();
        assert_eq!(versions, vec![1, 2]);
        let stored: Vec<_> = store
            .load_all(id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(committed.iter().map(|e| e.event_id).collect::<Vec<_>>(), stored);
    }

    #[tokio::test]
    async fn import_rejects_a_different_event_at_a_held_version() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let held = batch(id, &[1, 2]);
        store.import_events(held.clone()).await.unwrap();

        let impostor = create_test_event(id, Version::new(2), "Other");
        let fresh = create_test_event(id, Version::new(3), "Event3");
        let result = store.import_events(vec![fresh, impostor]).await;

        match result {
            Err(EventStoreError::ImportCollision {
                aggregate_id,
                versions,
            }) => {
                assert_eq!(aggregate_id, id);
                assert_eq!(versions, vec![Version::new(2)]);
            }
            other => panic!("expected a collision, got {other:?}"),
        }
        let stored: Vec<_> = store
            .load_all(id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(stored, held.iter().map(|e| e.event_id).collect::<Vec<_>>());
    }
}
