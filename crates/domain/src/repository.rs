//! Loading and saving aggregates through the event and snapshot stores.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use common::AggregateId;
use event_store::{
    AppendOptions, EventContext, EventSerializer, EventStore, Version, VersionRange,
};
use snapshot_store::{AggregateSnapshot, SnapshotCandidate, SnapshotStore, SnapshotStrategy};

use crate::aggregate::{Aggregate, SnapshotCapable};
use crate::error::DomainError;

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after applying the new events.
    pub aggregate: A,

    /// The events that were generated and persisted.
    pub events: Vec<A::Event>,

    /// The new version of the aggregate after the command.
    pub new_version: Version,

    /// Set when the append triggered a snapshot.
    pub snapshot: Option<Version>,
}

struct Snapshotting {
    store: Arc<dyn SnapshotStore>,
    strategy: Arc<SnapshotStrategy>,
}

/// Rebuilds aggregates from snapshots and events, and persists the events
/// commands produce.
///
/// Snapshots only ever speed up loading. A snapshot that is missing,
/// unreadable or fails its hash check is skipped and the aggregate is
/// replayed from its first event instead.
pub struct AggregateRepository<A> {
    events: Arc<dyn EventStore>,
    serializer: Arc<EventSerializer>,
    snapshots: Option<Snapshotting>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: SnapshotCapable> AggregateRepository<A> {
    /// Creates a repository that replays every load from the first event.
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self {
            events,
            serializer: Arc::new(EventSerializer::new()),
            snapshots: None,
            _aggregate: PhantomData,
        }
    }

    pub fn with_serializer(mut self, serializer: EventSerializer) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Snapshots according to `strategy` after each successful append.
    pub fn with_snapshots(
        mut self,
        store: Arc<dyn SnapshotStore>,
        strategy: SnapshotStrategy,
    ) -> Self {
        self.snapshots = Some(Snapshotting {
            store,
            strategy: Arc::new(strategy),
        });
        self
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    /// Loads an aggregate. A missing aggregate yields `A::default()`.
    #[tracing::instrument(skip(self), fields(aggregate_type = A::aggregate_type()))]
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<A, DomainError> {
        let started = Instant::now();

        let mut aggregate = match self.usable_snapshot(aggregate_id).await {
            Some(aggregate) => aggregate,
            None => A::default(),
        };
        let replayed = self.replay(&mut aggregate, aggregate_id).await?;

        let elapsed = started.elapsed();
        metrics::histogram!("aggregate_load_duration_seconds", "aggregate_type" => A::aggregate_type())
            .record(elapsed.as_secs_f64());
        if let Some(snapshots) = &self.snapshots {
            snapshots.strategy.record_load(aggregate_id, elapsed);
            snapshots.strategy.record_access(aggregate_id);
        }
        tracing::debug!(replayed, version = %aggregate.version(), "aggregate loaded");

        Ok(aggregate)
    }

    /// Loads an aggregate, returning None if it has no events.
    pub async fn load_existing(&self, aggregate_id: AggregateId) -> Result<Option<A>, DomainError> {
        let aggregate = self.load(aggregate_id).await?;
        Ok((aggregate.version() > Version::initial()).then_some(aggregate))
    }

    /// Loads an aggregate that must exist.
    pub async fn get(&self, aggregate_id: AggregateId) -> Result<A, DomainError> {
        self.load_existing(aggregate_id)
            .await?
            .ok_or(DomainError::AggregateNotFound {
                aggregate_type: A::aggregate_type(),
                aggregate_id,
            })
    }

    /// Executes a command and persists the resulting events.
    ///
    /// The command sees the current state and returns the events to record.
    /// The append expects the version the command saw, so a concurrent writer
    /// makes this fail with a conflict instead of silently interleaving.
    pub async fn execute<F>(
        &self,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
    {
        let context = EventContext::new(aggregate_id, A::aggregate_type());
        self.execute_with_context(context, command_fn).await
    }

    /// Like [`AggregateRepository::execute`], stamping `context`'s metadata
    /// (correlation, causation, user) on every event.
    #[tracing::instrument(skip(self, context, command_fn), fields(aggregate_id = %context.aggregate_id))]
    pub async fn execute_with_context<F>(
        &self,
        context: EventContext,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
    {
        let aggregate_id = context.aggregate_id;
        let mut aggregate = self.load(aggregate_id).await?;
        let current_version = aggregate.version();

        let events = command_fn(&aggregate).map_err(|e| DomainError::Rejected(Box::new(e)))?;
        if events.is_empty() {
            return Ok(CommandResult {
                aggregate,
                events,
                new_version: current_version,
                snapshot: None,
            });
        }

        let envelopes = self
            .serializer
            .serialize_batch(&events, &context, current_version)?;
        let new_version = self
            .events
            .append(
                aggregate_id,
                envelopes,
                AppendOptions::expect_version(current_version),
            )
            .await?;

        aggregate.apply_events(events.iter().cloned());
        aggregate.set_version(new_version);

        let snapshot = self.maybe_snapshot(aggregate_id, &aggregate).await;

        Ok(CommandResult {
            aggregate,
            events,
            new_version,
            snapshot,
        })
    }

    /// Takes a snapshot of the aggregate's current state regardless of strategy.
    pub async fn snapshot_now(&self, aggregate_id: AggregateId) -> Result<Option<Version>, DomainError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(None);
        };
        let aggregate = self.load(aggregate_id).await?;
        if aggregate.version() == Version::initial() {
            return Ok(None);
        }
        let snapshot = AggregateSnapshot::new(
            aggregate_id,
            A::aggregate_type(),
            aggregate.version(),
            aggregate.to_state()?,
        );
        snapshots.store.save(snapshot).await?;
        Ok(Some(aggregate.version()))
    }

    async fn usable_snapshot(&self, aggregate_id: AggregateId) -> Option<A> {
        let snapshots = self.snapshots.as_ref()?;
        let snapshot = match snapshots.store.load(aggregate_id).await {
            Ok(snapshot) => snapshot?,
            Err(e) => {
                tracing::warn!(%aggregate_id, error = %e, "snapshot unavailable, replaying");
                return None;
            }
        };

        if !snapshot.verify() {
            metrics::counter!("snapshot_integrity_failures_total").increment(1);
            tracing::warn!(%aggregate_id, version = %snapshot.version, "snapshot hash mismatch, replaying");
            return None;
        }
        match A::from_state(snapshot.state) {
            Ok(mut aggregate) => {
                aggregate.set_version(snapshot.version);
                Some(aggregate)
            }
            Err(e) => {
                tracing::warn!(%aggregate_id, error = %e, "snapshot state unreadable, replaying");
                None
            }
        }
    }

    async fn replay(&self, aggregate: &mut A, aggregate_id: AggregateId) -> Result<usize, DomainError> {
        let mut expected = aggregate.version().next();
        let envelopes = self
            .events
            .load(aggregate_id, VersionRange::starting_at(expected))
            .await?;
        for envelope in &envelopes {
            if envelope.version != expected {
                return Err(DomainError::IncompleteStream {
                    aggregate_id,
                    expected,
                    found: envelope.version,
                });
            }
            let event: A::Event = self.serializer.deserialize(envelope)?;
            aggregate.apply(event);
            aggregate.set_version(envelope.version);
            expected = expected.next();
        }
        Ok(envelopes.len())
    }

    /// Asks the strategy whether to snapshot. Failures here never fail the
    /// command, whose events are already committed.
    async fn maybe_snapshot(&self, aggregate_id: AggregateId, aggregate: &A) -> Option<Version> {
        let snapshots = self.snapshots.as_ref()?;
        let version = aggregate.version();

        match self.try_snapshot(snapshots, aggregate_id, aggregate).await {
            Ok(true) => {
                tracing::debug!(%aggregate_id, %version, strategy = snapshots.strategy.name(), "snapshot taken");
                Some(version)
            }
            Ok(false) => None,
            Err(e) => {
                tracing::warn!(%aggregate_id, %version, error = %e, "snapshot failed");
                None
            }
        }
    }

    async fn try_snapshot(
        &self,
        snapshots: &Snapshotting,
        aggregate_id: AggregateId,
        aggregate: &A,
    ) -> Result<bool, DomainError> {
        let version = aggregate.version();
        let state = aggregate.to_state()?;
        let state_size = serde_json::to_vec(&state)?.len();
        let last = snapshots.store.load(aggregate_id).await?;

        let candidate = SnapshotCandidate::new(aggregate_id, version).with_state_size(state_size);
        if !snapshots.strategy.should_snapshot(&candidate, last.as_ref()) {
            return Ok(false);
        }
        snapshots
            .store
            .save(AggregateSnapshot::new(aggregate_id, A::aggregate_type(), version, state))
            .await?;
        Ok(true)
    }
}
