use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AggregateId, EventStoreError, Result};

common::uuid_id! {
    /// Unique identifier of one stored event; the idempotency key for imports.
    pub struct EventId;
}

/// Position of an event in its aggregate's stream.
///
/// `Version::initial()` (0) means "no events yet"; the first event is 1 and
/// each later one increments by exactly 1. Appends state the version they
/// expect to follow, which is how optimistic concurrency is enforced.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn initial() -> Self {
        Self(0)
    }

    pub const fn first() -> Self {
        Self(1)
    }

    pub fn next(&self) -> Self {
        self.advance(1)
    }

    /// Moves `n` versions forward, saturating at the numeric bounds.
    pub fn advance(&self, n: i64) -> Self {
        Self(self.0.saturating_add(n))
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Signed number of events between `earlier` and `self`, saturating.
    pub fn distance_from(&self, earlier: Version) -> i64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Inclusive version window used when loading part of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionRange {
    pub from: Option<Version>,
    pub to: Option<Version>,
}

impl VersionRange {
    /// The whole stream.
    pub fn all() -> Self {
        Self::default()
    }

    /// Everything from `from` (inclusive) onward.
    pub fn starting_at(from: Version) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    /// Events between `from` and `to`, both inclusive.
    pub fn between(from: Option<Version>, to: Option<Version>) -> Self {
        Self { from, to }
    }

    /// Returns true if `version` falls inside the window.
    pub fn contains(&self, version: Version) -> bool {
        self.from.is_none_or(|from| version >= from) && self.to.is_none_or(|to| version <= to)
    }
}

/// Well-known metadata keys carried on every envelope.
pub mod metadata_keys {
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const CAUSATION_ID: &str = "causation_id";
    pub const USER_ID: &str = "user_id";
    pub const AGGREGATE_TYPE: &str = "aggregate_type";
    pub const SCHEMA_VERSION: &str = "schema_version";
}

/// One stored fact: a type tag, a JSON payload and free-form metadata,
/// positioned in its aggregate's stream by `version`. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,
    /// e.g. `"MoneyDeposited"`
    pub event_type: String,
    pub aggregate_id: AggregateId,
    /// e.g. `"Account"`
    pub aggregate_type: String,
    pub version: Version,
    /// When the fact occurred; also decides the warm partition.
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Returns a copy of this envelope renumbered to `version`.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Returns a copy of this envelope with a different occurrence time.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The payload schema version recorded in metadata, defaulting to 1.
    pub fn schema_version(&self) -> u32 {
        self.metadata
            .get(metadata_keys::SCHEMA_VERSION)
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(1)
    }

    /// Returns a string metadata entry, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(serde_json::Value::as_str)
    }
}

/// Assembles an [`EventEnvelope`].
///
/// `event_type`, `aggregate_id`, `aggregate_type` and `version` are required.
/// The id defaults to a fresh one, the timestamp to now, the payload to null.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: Option<String>,
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    version: Option<Version>,
    timestamp: Option<DateTime<Utc>>,
    payload: serde_json::Value,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Serializes `payload` to JSON.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Records the correlation id shared by every event of one request.
    pub fn correlation_id(self, id: impl Into<String>) -> Self {
        self.metadata(metadata_keys::CORRELATION_ID, id.into().into())
    }

    /// Records the id of the message that caused this event.
    pub fn causation_id(self, id: impl Into<String>) -> Self {
        self.metadata(metadata_keys::CAUSATION_ID, id.into().into())
    }

    pub fn user_id(self, id: impl Into<String>) -> Self {
        self.metadata(metadata_keys::USER_ID, id.into().into())
    }

    /// Fails with [`EventStoreError::InvalidBatch`] naming the first missing
    /// required field.
    pub fn build(self) -> Result<EventEnvelope> {
        fn required<T>(value: Option<T>, field: &str) -> Result<T> {
            value.ok_or_else(|| EventStoreError::InvalidBatch(format!("envelope is missing {field}")))
        }

        Ok(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: required(self.event_type, "event_type")?,
            aggregate_id: required(self.aggregate_id, "aggregate_id")?,
            aggregate_type: required(self.aggregate_type, "aggregate_type")?,
            version: required(self.version, "version")?,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_steps() {
        assert_eq!(Version::initial().next(), Version::first());
        assert_eq!(Version::first().advance(4), Version::new(5));
        assert_eq!(Version::new(12).distance_from(Version::new(10)), 2);
        assert!(Version::new(1) < Version::new(2));
        assert_eq!(Version::new(i64::MAX).next(), Version::new(i64::MAX));
        assert_eq!(Version::new(5).distance_from(Version::new(i64::MIN)), i64::MAX);
        assert_eq!(serde_json::to_value(Version::new(7)).unwrap(), serde_json::json!(7));
    }

    #[test]
    fn event_ids_are_unique() {
        assert_ne!(EventId::new(), EventId::new());
    }

    #[test]
    fn builder_fills_defaults() {
        let aggregate_id = AggregateId::new();
        let envelope = EventEnvelope::builder()
            .event_type("AccountOpened")
            .aggregate_id(aggregate_id)
            .aggregate_type("Account")
            .version(Version::first())
            .build()
            .unwrap();

        assert_eq!(envelope.aggregate_id, aggregate_id);
        assert_eq!(envelope.payload, serde_json::Value::Null);
        assert!(envelope.metadata.is_empty());
        assert_eq!(envelope.schema_version(), 1);
    }

    #[test]
    fn builder_names_the_missing_field() {
        let err = EventEnvelope::builder()
            .event_type("AccountOpened")
            .aggregate_id(AggregateId::new())
            .version(Version::first())
            .build()
            .unwrap_err();

        assert!(err.to_string().contains("aggregate_type"));
    }

    #[test]
    fn version_range_contains() {
        let range = VersionRange::between(Some(Version::new(2)), Some(Version::new(4)));
        assert!(!range.contains(Version::new(1)));
        assert!(range.contains(Version::new(2)));
        assert!(range.contains(Version::new(4)));
        assert!(!range.contains(Version::new(5)));
        assert!(VersionRange::all().contains(Version::new(99)));
        assert!(VersionRange::starting_at(Version::new(3)).contains(Version::new(99)));
    }

    #[test]
    fn metadata_helpers_and_schema_version() {
        let envelope = EventEnvelope::builder()
            .event_type("MoneyDeposited")
            .aggregate_id(AggregateId::new())
            .aggregate_type("Account")
            .version(Version::first())
            .correlation_id("corr-1")
            .causation_id("cmd-7")
            .user_id("alice")
            .metadata(metadata_keys::SCHEMA_VERSION, serde_json::json!(3))
            .build()
            .unwrap();

        assert_eq!(envelope.metadata_str(metadata_keys::CORRELATION_ID), Some("corr-1"));
        assert_eq!(envelope.metadata_str(metadata_keys::CAUSATION_ID), Some("cmd-7"));
        assert_eq!(envelope.metadata_str(metadata_keys::USER_ID), Some("alice"));
        assert_eq!(envelope.schema_version(), 3);
    }
}
