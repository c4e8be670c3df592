//! On-disk shape of the cold tier.
//!
//! ```text
//! aggregates/{shard}/{aggregate_id}/{partition}.json[.{ext}]   one chunk per aggregate and partition
//! partitions/{partition}.json                                  manifest of an archived partition
//! ```

use chrono::{DateTime, Utc};
use event_store::{AggregateId, EventEnvelope};
use serde::{Deserialize, Serialize};
use snapshot_store::{CompressionMethod, SnapshotCompression};

use crate::error::{ArchivalError, Result};

pub const AGGREGATES_PREFIX: &str = "aggregates/";
pub const PARTITIONS_PREFIX: &str = "partitions/";

/// One aggregate's events from one warm partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveChunk {
    pub aggregate_id: AggregateId,
    pub partition: String,
    pub archived_at: DateTime<Utc>,
    pub events: Vec<EventEnvelope>,
}

impl ArchiveChunk {
    /// Structural check of every event in the chunk.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for event in &self.events {
            if event.event_type.is_empty() {
                return Err(format!("event {} has no type", event.event_id));
            }
            if event.version.as_i64() < 1 {
                return Err(format!("event {} has version {}", event.event_id, event.version));
            }
            if event.aggregate_id != self.aggregate_id {
                return Err(format!(
                    "event {} belongs to {}",
                    event.event_id, event.aggregate_id
                ));
            }
        }
        Ok(())
    }
}

/// Written once a partition's chunks are all in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub partition: String,
    pub archived_at: DateTime<Utc>,
    pub compression: CompressionMethod,
    pub event_count: u64,
    pub chunks: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub aggregate_id: AggregateId,
    pub path: String,
    pub events: u64,
    pub bytes: u64,
}

/// Directory holding every chunk of an aggregate, with a trailing slash.
pub fn aggregate_prefix(aggregate_id: AggregateId) -> String {
    format!(
        "{AGGREGATES_PREFIX}{}/{aggregate_id}/",
        aggregate_id.shard_prefix()
    )
}

pub fn chunk_path(aggregate_id: AggregateId, partition: &str, method: CompressionMethod) -> String {
    let prefix = aggregate_prefix(aggregate_id);
    match method {
        CompressionMethod::None => format!("{prefix}{partition}.json"),
        method => format!("{prefix}{partition}.json.{}", method.extension()),
    }
}

pub fn manifest_path(partition: &str) -> String {
    format!("{PARTITIONS_PREFIX}{partition}.json")
}

/// Compression a chunk was written with, judging by its name.
pub fn method_for(path: &str) -> Option<CompressionMethod> {
    if path.ends_with(".json") {
        return Some(CompressionMethod::None);
    }
    let (_, ext) = path.rsplit_once(".json.")?;
    CompressionMethod::from_extension(ext)
}

pub fn encode_chunk(chunk: &ArchiveChunk, codec: &SnapshotCompression) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(chunk)?;
    Ok(codec.compress(&json)?)
}

/// Decodes a chunk blob.
///
/// Blobs that fail to decompress are retried as plain JSON, since a chunk may
/// have been written uncompressed under a compressed name.
pub fn decode_chunk(path: &str, data: &[u8], codec: &SnapshotCompression) -> Result<ArchiveChunk> {
    let corrupted = |reason: String| ArchivalError::Corrupted {
        path: path.to_string(),
        reason,
    };

    let method = method_for(path).ok_or_else(|| corrupted("unrecognised extension".into()))?;
    let chunk: ArchiveChunk = match codec.decompress(data, Some(method)) {
        Ok(json) => serde_json::from_slice(&json)
            .or_else(|_| serde_json::from_slice(data))
            .map_err(|e| corrupted(e.to_string()))?,
        Err(e) => serde_json::from_slice(data).map_err(|_| corrupted(e.to_string()))?,
    };
    chunk.validate().map_err(corrupted)?;
    Ok(chunk)
}
