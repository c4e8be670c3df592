//! Contracts an aggregate implements to be persisted and snapshotted.

use common::AggregateId;
pub use event_store::DomainEvent;
use event_store::Version;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// State rebuilt by folding an aggregate's events in version order.
///
/// Business rules live in the commands that produce events; `apply` only
/// folds a fact that already happened and therefore cannot fail.
pub trait Aggregate: Default + Send + Sync + Sized {
    type Event: DomainEvent;

    /// Raised by commands that the current state refuses.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Stored on every envelope and snapshot, e.g. `"Account"`.
    fn aggregate_type() -> &'static str;

    /// `None` until the creating event has been applied.
    fn id(&self) -> Option<AggregateId>;

    /// Version of the last applied event; `Version::initial()` when new.
    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    fn apply(&mut self, event: Self::Event);

    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        events.into_iter().for_each(|event| self.apply(event));
    }
}

/// Aggregates whose state can be captured in a snapshot.
///
/// The default methods round-trip the aggregate through serde; override them
/// to snapshot a narrower view of the state.
pub trait SnapshotCapable: Aggregate + Serialize + DeserializeOwned {
    /// Serializes the state. The version is stored alongside, not inside.
    fn to_state(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Rebuilds an aggregate from [`SnapshotCapable::to_state`] output.
    fn from_state(state: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(state)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum CounterEvent {
        Started { id: AggregateId },
        Incremented { by: u32 },
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                CounterEvent::Started { .. } => "CounterStarted",
                CounterEvent::Incremented { .. } => "CounterIncremented",
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("counter overflow")]
    struct Overflow;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        id: Option<AggregateId>,
        total: u32,
        #[serde(skip)]
        version: Version,
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;
        type Error = Overflow;

        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn id(&self) -> Option<AggregateId> {
            self.id
        }

        fn version(&self) -> Version {
            self.version
        }

        fn set_version(&mut self, version: Version) {
            self.version = version;
        }

        fn apply(&mut self, event: CounterEvent) {
            match event {
                CounterEvent::Started { id } => self.id = Some(id),
                CounterEvent::Incremented { by } => self.total += by,
            }
        }
    }

    impl SnapshotCapable for Counter {}

    #[test]
    fn apply_events_folds_in_order() {
        let id = AggregateId::new();
        let mut counter = Counter::default();

        counter.apply_events([
            CounterEvent::Started { id },
            CounterEvent::Incremented { by: 2 },
            CounterEvent::Incremented { by: 5 },
        ]);

        assert_eq!(counter.id(), Some(id));
        assert_eq!(counter.total, 7);
    }

    #[test]
    fn state_round_trips_without_version() {
        let mut counter = Counter::default();
        counter.apply(CounterEvent::Started { id: AggregateId::new() });
        counter.apply(CounterEvent::Incremented { by: 3 });
        counter.set_version(Version::new(2));

        let state = counter.to_state().unwrap();
        assert!(state.get("version").is_none());

        let mut restored = Counter::from_state(state).unwrap();
        assert_eq!(restored.version(), Version::initial());
        restored.set_version(Version::new(2));
        assert_eq!(restored, counter);
    }
}
