//! Conversion between domain events and storable envelopes.
//!
//! Payloads carry a schema version in metadata. When an event's shape changes,
//! register an upcaster that lifts the old JSON one version at a time; reads
//! always hand the current shape to the caller.

use std::collections::HashMap;
use std::fmt;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::event::metadata_keys;
use crate::{AggregateId, EventEnvelope, EventStoreError, Result, Version};

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name.
    ///
    /// This is used for serialization and event store filtering.
    fn event_type(&self) -> &'static str;

    /// Schema version of the payload this type serializes to.
    fn schema_version(&self) -> u32 {
        1
    }
}

/// Lifts a payload from one schema version to the next.
pub type Upcaster = Box<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Per-append context shared by every event in a batch.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub metadata: HashMap<String, Value>,
}

impl EventContext {
    /// Creates a context for one aggregate.
    pub fn new(aggregate_id: AggregateId, aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            metadata: HashMap::new(),
        }
    }

    /// Sets the correlation id.
    pub fn correlation_id(self, id: impl Into<String>) -> Self {
        self.with(metadata_keys::CORRELATION_ID, Value::String(id.into()))
    }

    /// Sets the causation id.
    pub fn causation_id(self, id: impl Into<String>) -> Self {
        self.with(metadata_keys::CAUSATION_ID, Value::String(id.into()))
    }

    /// Sets the acting user.
    pub fn user_id(self, id: impl Into<String>) -> Self {
        self.with(metadata_keys::USER_ID, Value::String(id.into()))
    }

    /// Adds an arbitrary metadata entry.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Serializes domain events into envelopes and back.
///
/// With no registrations every event type is accepted. Once
/// [`EventSerializer::strict`] is set, decoding an unregistered type fails with
/// [`EventStoreError::UnknownEventType`].
#[derive(Default)]
pub struct EventSerializer {
    known_types: HashMap<String, u32>,
    upcasters: HashMap<(String, u32), Upcaster>,
    strict: bool,
}

impl fmt::Debug for EventSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSerializer")
            .field("known_types", &self.known_types)
            .field("upcasters", &self.upcasters.len())
            .field("strict", &self.strict)
            .finish()
    }
}

impl EventSerializer {
    /// Creates a permissive serializer with no registrations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects event types that were never registered.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Registers an event type and its current schema version.
    pub fn register(mut self, event_type: impl Into<String>, schema_version: u32) -> Self {
        self.known_types.insert(event_type.into(), schema_version);
        self
    }

    /// Registers an upcaster lifting `event_type` from `from_version` to `from_version + 1`.
    pub fn register_upcaster<F>(
        mut self,
        event_type: impl Into<String>,
        from_version: u32,
        upcaster: F,
    ) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.upcasters
            .insert((event_type.into(), from_version), Box::new(upcaster));
        self
    }

    /// Returns true if the type was registered.
    pub fn is_known(&self, event_type: &str) -> bool {
        self.known_types.contains_key(event_type)
    }

    /// Serializes one event at the given version.
    pub fn serialize<E: DomainEvent>(
        &self,
        event: &E,
        context: &EventContext,
        version: Version,
    ) -> Result<EventEnvelope> {
        let mut builder = EventEnvelope::builder()
            .aggregate_id(context.aggregate_id)
            .aggregate_type(context.aggregate_type.clone())
            .event_type(event.event_type())
            .version(version)
            .payload(event)?
            .metadata(
                metadata_keys::AGGREGATE_TYPE,
                Value::String(context.aggregate_type.clone()),
            )
            .metadata(
                metadata_keys::SCHEMA_VERSION,
                Value::from(event.schema_version()),
            );
        for (key, value) in &context.metadata {
            builder = builder.metadata(key.clone(), value.clone());
        }

        builder.build()
    }

    /// Serializes a batch, numbering events consecutively after `current`.
    pub fn serialize_batch<E: DomainEvent>(
        &self,
        events: &[E],
        context: &EventContext,
        current: Version,
    ) -> Result<Vec<EventEnvelope>> {
        let mut version = current;
        events
            .iter()
            .map(|event| {
                version = version.next();
                self.serialize(event, context, version)
            })
            .collect()
    }

    /// Decodes an envelope's payload, applying upcasters as needed.
    pub fn deserialize<E: DeserializeOwned>(&self, envelope: &EventEnvelope) -> Result<E> {
        let payload = self.upcast(envelope)?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Returns the payload lifted to the registered schema version.
    pub fn upcast(&self, envelope: &EventEnvelope) -> Result<Value> {
        let target = match self.known_types.get(&envelope.event_type) {
            Some(version) => *version,
            None if self.strict => {
                return Err(EventStoreError::UnknownEventType(
                    envelope.event_type.clone(),
                ));
            }
            None => return Ok(envelope.payload.clone()),
        };

        let mut version = envelope.schema_version();
        let mut payload = envelope.payload.clone();
        while version < target {
            let key = (envelope.event_type.clone(), version);
            let upcaster = self.upcasters.get(&key).ok_or_else(|| {
                EventStoreError::UnknownEventType(format!(
                    "{} has no upcaster from schema version {version}",
                    envelope.event_type
                ))
            })?;
            payload = upcaster(payload)?;
            version += 1;
        }
        Ok(payload)
    }
}
