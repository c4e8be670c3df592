use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

use crate::{AggregateId, Version};

/// A snapshot of an aggregate's state at a specific version.
///
/// Snapshots are used to optimize aggregate reconstruction by providing
/// a starting point, avoiding the need to replay all events from the beginning.
/// A snapshot is never updated; a later one at a higher version supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// The aggregate this snapshot belongs to.
    pub aggregate_id: AggregateId,

    /// The type of aggregate (e.g., "Account", "Customer").
    pub aggregate_type: String,

    /// Version of the last event folded into `state`.
    pub version: Version,

    /// The serialized aggregate state.
    pub state: serde_json::Value,

    /// When the snapshot was created.
    pub created_at: DateTime<Utc>,

    /// Lowercase hex SHA-256 over id, type, version and state.
    pub hash: String,
}

impl AggregateSnapshot {
    /// Creates a new snapshot taken now.
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: serde_json::Value,
    ) -> Self {
        Self::taken_at(aggregate_id, aggregate_type, version, state, Utc::now())
    }

    /// Creates a snapshot with an explicit creation time.
    pub fn taken_at(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        let aggregate_type = aggregate_type.into();
        let hash = Self::compute_hash(aggregate_id, &aggregate_type, version, &state);
        Self {
            aggregate_id,
            aggregate_type,
            version,
            state,
            created_at,
            hash,
        }
    }

    /// Creates a snapshot from a serializable state.
    pub fn from_state<T: Serialize>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            aggregate_id,
            aggregate_type,
            version,
            serde_json::to_value(state)?,
        ))
    }

    /// Deserializes the state into a concrete type.
    pub fn into_state<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state.clone())
    }

    /// Hash over the identifying fields and the canonical JSON of `state`.
    ///
    /// Object keys are hashed in sorted order, so equal states hash equally
    /// regardless of the field order they were built with.
    pub fn compute_hash(
        aggregate_id: AggregateId,
        aggregate_type: &str,
        version: Version,
        state: &serde_json::Value,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(aggregate_id.as_uuid().as_bytes());
        hasher.update(aggregate_type.as_bytes());
        hasher.update(version.as_i64().to_be_bytes());
        let mut canonical = Vec::new();
        write_canonical(state, &mut canonical);
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }

    /// Returns true if `hash` matches a recomputation from the other fields.
    pub fn verify(&self) -> bool {
        Self::compute_hash(
            self.aggregate_id,
            &self.aggregate_type,
            self.version,
            &self.state,
        ) == self.hash
    }
}

fn write_canonical(value: &serde_json::Value, out: &mut Vec<u8>) {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(serde_json::Value::from(key.as_str()).to_string().as_bytes());
                out.push(b':');
                write_canonical(value, out);
            }
            out.push(b'}');
        }
        serde_json::Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

/// A stored snapshot whose hash does not match its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptSnapshot {
    pub aggregate_id: AggregateId,
    pub version: Version,
    pub stored_hash: String,
    /// `None` when the state could not be decoded at all.
    pub computed_hash: Option<String>,
}
