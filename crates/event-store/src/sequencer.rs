//! Event ordering enforcement.
//!
//! Envelopes arrive carrying the sequence number (version) their producer
//! intended. The sequencer checks a batch against the last committed sequence
//! for the aggregate and either passes it through unchanged (strict mode) or
//! sorts it, tolerating gaps up to a bounded reorder window (relaxed mode).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{AggregateId, EventEnvelope, EventStoreError, Result, Version};

/// Default maximum distance between consecutive accepted sequence numbers in
/// relaxed mode.
pub const DEFAULT_REORDER_WINDOW: u32 = 10;

/// Default number of aggregates [`EventSequencer::enforce_order`] remembers.
pub const DEFAULT_MAX_TRACKED: usize = 100_000;

/// How strictly a batch must already be ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingMode {
    /// Every event must be exactly the previous sequence number plus one.
    #[default]
    Strict,
    /// Events are sorted; consecutive sequence numbers may differ by up to
    /// `max_reorder_window`.
    Relaxed { max_reorder_window: u32 },
}

impl OrderingMode {
    /// Relaxed mode with the default window.
    pub fn relaxed() -> Self {
        OrderingMode::Relaxed {
            max_reorder_window: DEFAULT_REORDER_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    version: Version,
    used: u64,
}

#[derive(Debug, Default)]
struct TrackedSequences {
    by_aggregate: HashMap<AggregateId, Tracked>,
    uses: u64,
}

impl TrackedSequences {
    /// Forgets the least recently used aggregates until a quarter of `limit` is free.
    fn shrink_to(&mut self, limit: usize) {
        let keep = limit - limit / 4;
        let excess = self.by_aggregate.len().saturating_sub(keep);
        if excess == 0 {
            return;
        }
        let mut uses: Vec<u64> = self.by_aggregate.values().map(|t| t.used).collect();
        uses.sort_unstable();
        let cutoff = uses[excess - 1];
        self.by_aggregate.retain(|_, t| t.used > cutoff);
        tracing::debug!(forgotten = excess, "sequencer tracking trimmed");
    }
}

/// Validates, and in relaxed mode reorders, batches of events per aggregate.
///
/// The stateful [`EventSequencer::enforce_order`] remembers at most
/// `max_tracked` aggregates; the least recently used are forgotten first and
/// are treated as new on their next batch.
#[derive(Debug)]
pub struct EventSequencer {
    mode: OrderingMode,
    max_tracked: usize,
    last_seen: Mutex<TrackedSequences>,
}

impl Default for EventSequencer {
    fn default() -> Self {
        Self::new(OrderingMode::default())
    }
}

impl EventSequencer {
    /// Creates a sequencer in the given mode.
    pub fn new(mode: OrderingMode) -> Self {
        Self {
            mode,
            max_tracked: DEFAULT_MAX_TRACKED,
            last_seen: Mutex::new(TrackedSequences::default()),
        }
    }

    /// Caps how many aggregates `enforce_order` remembers. At least one is kept.
    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked.max(1);
        self
    }

    /// A sequencer that never reorders.
    pub fn strict() -> Self {
        Self::new(OrderingMode::Strict)
    }

    /// A sequencer that sorts within `max_reorder_window`.
    pub fn relaxed(max_reorder_window: u32) -> Self {
        Self::new(OrderingMode::Relaxed { max_reorder_window })
    }

    /// Returns the configured mode.
    pub fn mode(&self) -> OrderingMode {
        self.mode
    }

    /// Orders `events` against the last sequence this sequencer accepted for
    /// the aggregate, remembering the new high-water mark on success.
    pub fn enforce_order(
        &self,
        aggregate_id: AggregateId,
        events: Vec<EventEnvelope>,
    ) -> Result<Vec<EventEnvelope>> {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        let last = last_seen
            .by_aggregate
            .get(&aggregate_id)
            .map(|t| t.version)
            .unwrap_or(Version::initial());

        let ordered = self.order_after(aggregate_id, last, events)?;
        if let Some(tail) = ordered.last() {
            last_seen.uses += 1;
            let used = last_seen.uses;
            last_seen.by_aggregate.insert(
                aggregate_id,
                Tracked {
                    version: tail.version,
                    used,
                },
            );
            if last_seen.by_aggregate.len() > self.max_tracked {
                last_seen.shrink_to(self.max_tracked);
            }
        }
        Ok(ordered)
    }

    /// Orders `events` against an externally supplied committed version.
    ///
    /// Stateless: stores call this with the version they read inside their
    /// own commit critical section.
    pub fn order_after(
        &self,
        aggregate_id: AggregateId,
        last_committed: Version,
        events: Vec<EventEnvelope>,
    ) -> Result<Vec<EventEnvelope>> {
        if events.is_empty() {
            return Ok(events);
        }

        match self.mode {
            OrderingMode::Strict => {
                let mut expected = last_committed.next();
                for event in &events {
                    if event.version != expected {
                        return Err(EventStoreError::OrderingViolation {
                            aggregate_id,
                            expected,
                            found: event.version,
                        });
                    }
                    expected = expected.next();
                }
                Ok(events)
            }
            OrderingMode::Relaxed { max_reorder_window } => {
                let mut events = events;
                // stable: equal sequence numbers keep batch order
                events.sort_by_key(|e| e.version);

                let window = i64::from(max_reorder_window);
                let mut previous = last_committed;
                for event in &events {
                    if event.version <= last_committed
                        || event.version.distance_from(previous) > window
                    {
                        return Err(EventStoreError::OrderingViolation {
                            aggregate_id,
                            expected: previous.next(),
                            found: event.version,
                        });
                    }
                    previous = event.version;
                }
                Ok(events)
            }
        }
    }

    /// Last sequence accepted through [`EventSequencer::enforce_order`].
    pub fn last_sequence(&self, aggregate_id: AggregateId) -> Version {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_aggregate
            .get(&aggregate_id)
            .map(|t| t.version)
            .unwrap_or(Version::initial())
    }

    /// Number of aggregates currently remembered by `enforce_order`.
    pub fn tracked_aggregates(&self) -> usize {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_aggregate
            .len()
    }

    /// Forgets the tracked sequence for an aggregate.
    pub fn reset(&self, aggregate_id: AggregateId) {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_aggregate
            .remove(&aggregate_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(aggregate_id: AggregateId, version: i64, tag: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("TestAggregate")
            .event_type(tag)
            .version(Version::new(version))
            .payload_raw(serde_json::json!({"tag": tag}))
            .build()
            .unwrap()
    }

    fn versions(events: &[EventEnvelope]) -> Vec<i64> {
        events.iter().map(|e| e.version.as_i64()).collect()
    }

    #[test]
    fn empty_batch_is_accepted() {
        let sequencer = EventSequencer::strict();
        let ordered = sequencer.enforce_order(AggregateId::new(), vec![]).unwrap();
        assert!(ordered.is_empty());
    }

    #[test]
    fn strict_accepts_gapless_batch() {
        let sequencer = EventSequencer::strict();
        let id = AggregateId::new();
        let batch = vec![event(id, 1, "a"), event(id, 2, "b"), event(id, 3, "c")];

        let ordered = sequencer.enforce_order(id, batch).unwrap();

        assert_eq!(versions(&ordered), vec![1, 2, 3]);
        assert_eq!(sequencer.last_sequence(id), Version::new(3));
    }

    #[test]
    fn strict_rejects_gap() {
        let sequencer = EventSequencer::strict();
        let id = AggregateId::new();

        let result = sequencer.enforce_order(id, vec![event(id, 1, "a"), event(id, 3, "c")]);

        match result {
            Err(EventStoreError::OrderingViolation {
                aggregate_id,
                expected,
                found,
            }) => {
                assert_eq!(aggregate_id, id);
                assert_eq!(expected, Version::new(2));
                assert_eq!(found, Version::new(3));
            }
            other => panic!("expected ordering violation, got {other:?}"),
        }
        assert_eq!(sequencer.last_sequence(id), Version::initial());
    }

    #[test]
    fn strict_rejects_inversion() {
        let sequencer = EventSequencer::strict();
        let id = AggregateId::new();
        let batch = vec![event(id, 1, "a"), event(id, 3, "c"), event(id, 2, "b")];

        assert!(matches!(
            sequencer.enforce_order(id, batch),
            Err(EventStoreError::OrderingViolation { .. })
        ));
    }

    #[test]
    fn strict_continues_across_calls() {
        let sequencer = EventSequencer::strict();
        let id = AggregateId::new();
        sequencer
            .enforce_order(id, vec![event(id, 1, "a"), event(id, 2, "b")])
            .unwrap();

        assert!(sequencer.enforce_order(id, vec![event(id, 3, "c")]).is_ok());
        assert!(sequencer.enforce_order(id, vec![event(id, 3, "c")]).is_err());
    }

    #[test]
    fn relaxed_sorts_out_of_order_batch() {
        let sequencer = EventSequencer::relaxed(5);
        let id = AggregateId::new();
        let batch = vec![event(id, 3, "c"), event(id, 1, "a"), event(id, 2, "b")];

        let ordered = sequencer.enforce_order(id, batch).unwrap();

        assert_eq!(versions(&ordered), vec![1, 2, 3]);
    }

    #[test]
    fn relaxed_rejects_jump_beyond_window() {
        let window = 4;
        let sequencer = EventSequencer::relaxed(window);
        let id = AggregateId::new();
        let batch = vec![event(id, 1, "a"), event(id, 1 + i64::from(window) + 1, "far")];

        assert!(matches!(
            sequencer.enforce_order(id, batch),
            Err(EventStoreError::OrderingViolation { .. })
        ));
    }

    #[test]
    fn relaxed_rejects_extreme_versions_without_overflow() {
        let sequencer = EventSequencer::relaxed(1000);
        let id = AggregateId::new();

        let result = sequencer.order_after(id, Version::new(5), vec![event(id, i64::MIN, "low")]);
        assert!(matches!(
            result,
            Err(EventStoreError::OrderingViolation { found, .. }) if found == Version::new(i64::MIN)
        ));

        let result = sequencer.order_after(id, Version::new(-5), vec![event(id, i64::MAX, "high")]);
        assert!(matches!(result, Err(EventStoreError::OrderingViolation { .. })));
    }

    #[test]
    fn relaxed_accepts_gap_within_window() {
        let sequencer = EventSequencer::relaxed(4);
        let id = AggregateId::new();
        let batch = vec![event(id, 1, "a"), event(id, 5, "e")];

        let ordered = sequencer.enforce_order(id, batch).unwrap();
        assert_eq!(versions(&ordered), vec![1, 5]);
    }

    #[test]
    fn relaxed_ties_keep_batch_order() {
        let sequencer = EventSequencer::relaxed(3);
        let id = AggregateId::new();
        let batch = vec![
            event(id, 2, "second-a"),
            event(id, 1, "first"),
            event(id, 2, "second-b"),
        ];

        let ordered = sequencer.enforce_order(id, batch).unwrap();
        let tags: Vec<_> = ordered.iter().map(|e| e.event_type.as_str()).collect();

        assert_eq!(tags, vec!["first", "second-a", "second-b"]);
    }

    #[test]
    fn relaxed_rejects_already_committed_versions() {
        let sequencer = EventSequencer::relaxed(10);
        let id = AggregateId::new();

        let result = sequencer.order_after(id, Version::new(5), vec![event(id, 5, "dup")]);

        assert!(matches!(
            result,
            Err(EventStoreError::OrderingViolation { .. })
        ));
    }

    #[test]
    fn relaxed_handles_large_shuffled_batches() {
        let sequencer = EventSequencer::relaxed(DEFAULT_REORDER_WINDOW);
        let id = AggregateId::new();
        // reverse each block of 8 so every event is displaced but within the window
        let mut batch = Vec::new();
        for block in 0..500 {
            for offset in (1..=8).rev() {
                batch.push(event(id, block * 8 + offset, "bulk"));
            }
        }

        let ordered = sequencer.enforce_order(id, batch).unwrap();

        assert_eq!(ordered.len(), 4000);
        assert!(ordered.windows(2).all(|w| w[0].version < w[1].version));
    }

    #[test]
    fn reset_forgets_state() {
        let sequencer = EventSequencer::strict();
        let id = AggregateId::new();
        sequencer.enforce_order(id, vec![event(id, 1, "a")]).unwrap();

        sequencer.reset(id);

        assert_eq!(sequencer.last_sequence(id), Version::initial());
        assert!(sequencer.enforce_order(id, vec![event(id, 1, "a")]).is_ok());
    }

    #[test]
    fn tracking_forgets_least_recently_used_aggregates() {
        let sequencer = EventSequencer::strict().with_max_tracked(4);
        let ids: Vec<_> = (0..5).map(|_| AggregateId::new()).collect();
        for id in &ids[..4] {
            sequencer.enforce_order(*id, vec![event(*id, 1, "a")]).unwrap();
        }
        // touch the first again so the second becomes the oldest
        sequencer.enforce_order(ids[0], vec![event(ids[0], 2, "b")]).unwrap();

        sequencer.enforce_order(ids[4], vec![event(ids[4], 1, "a")]).unwrap();

        assert_eq!(sequencer.tracked_aggregates(), 3);
        assert_eq!(sequencer.last_sequence(ids[0]), Version::new(2));
        assert_eq!(sequencer.last_sequence(ids[1]), Version::initial());
        assert_eq!(sequencer.last_sequence(ids[2]), Version::initial());
        assert_eq!(sequencer.last_sequence(ids[4]), Version::first());
    }
}
