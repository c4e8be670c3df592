use chrono::{DateTime, Utc};

use crate::{
    AggregateId, AggregateSnapshot, Version,
    compression::{CompressionMethod, SnapshotCompression},
    error::{Result, SnapshotError},
};

/// A snapshot as persisted: state as (possibly compressed) bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub version: Version,
    pub state: Vec<u8>,
    pub compression: CompressionMethod,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// Converts between [`AggregateSnapshot`] and [`SnapshotRecord`].
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCodec {
    compression: SnapshotCompression,
    min_ratio: f64,
}

impl Default for SnapshotCodec {
    fn default() -> Self {
        Self::new(SnapshotCompression::none(), 1.0)
    }
}

impl SnapshotCodec {
    /// State is compressed only when the ratio achieved is below `min_ratio`.
    pub fn new(compression: SnapshotCompression, min_ratio: f64) -> Self {
        Self {
            compression,
            min_ratio,
        }
    }

    pub fn compression(&self) -> SnapshotCompression {
        self.compression
    }

    pub fn encode(&self, snapshot: &AggregateSnapshot) -> Result<SnapshotRecord> {
        let raw = serde_json::to_vec(&snapshot.state)?;
        let (state, compression) = match self.compression.compress_if_worthwhile(&raw, self.min_ratio)? {
            Some(compressed) => {
                let stats = self.compression.stats(raw.len(), compressed.len());
                tracing::debug!(
                    aggregate_id = %snapshot.aggregate_id,
                    method = %stats.method,
                    ratio = stats.ratio,
                    "snapshot state compressed"
                );
                (compressed, self.compression.method())
            }
            None => (raw, CompressionMethod::None),
        };

        Ok(SnapshotRecord {
            aggregate_id: snapshot.aggregate_id,
            aggregate_type: snapshot.aggregate_type.clone(),
            version: snapshot.version,
            state,
            compression,
            hash: snapshot.hash.clone(),
            created_at: snapshot.created_at,
        })
    }

    /// Decodes a record, falling back to reading the bytes as uncompressed
    /// JSON when decompression or parsing fails.
    pub fn decode(&self, record: SnapshotRecord) -> Result<AggregateSnapshot> {
        let decoded = self
            .compression
            .decompress(&record.state, Some(record.compression))
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                serde_json::from_slice::<serde_json::Value>(&bytes).map_err(|e| e.to_string())
            });

        let state = match decoded {
            Ok(state) => state,
            Err(first) if record.compression != CompressionMethod::None => {
                tracing::warn!(
                    aggregate_id = %record.aggregate_id,
                    version = %record.version,
                    method = %record.compression,
                    error = %first,
                    "snapshot decompression failed, reading state as uncompressed"
                );
                serde_json::from_slice(&record.state).map_err(|e| SnapshotError::Decode {
                    aggregate_id: record.aggregate_id,
                    version: record.version,
                    reason: format!("{first}; uncompressed fallback: {e}"),
                })?
            }
            Err(reason) => {
                return Err(SnapshotError::Decode {
                    aggregate_id: record.aggregate_id,
                    version: record.version,
                    reason,
                });
            }
        };

        Ok(AggregateSnapshot {
            aggregate_id: record.aggregate_id,
            aggregate_type: record.aggregate_type,
            version: record.version,
            state,
            created_at: record.created_at,
            hash: record.hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn large_snapshot() -> AggregateSnapshot {
        let lines: Vec<_> = (0..200)
            .map(|i| serde_json::json!({"sku": format!("SKU-{}", i % 7), "qty": 1}))
            .collect();
        AggregateSnapshot::new(
            AggregateId::new(),
            "Cart",
            Version::new(200),
            serde_json::json!({ "lines": lines }),
        )
    }

    #[test]
    fn small_state_stays_uncompressed() {
        let codec = SnapshotCodec::default();
        let snapshot = AggregateSnapshot::new(
            AggregateId::new(),
            "Cart",
            Version::new(1),
            serde_json::json!({"lines": []}),
        );

        let record = codec.encode(&snapshot).unwrap();

        assert_eq!(record.compression, CompressionMethod::None);
        assert_eq!(codec.decode(record).unwrap(), snapshot);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn large_state_round_trips_compressed() {
        let codec = SnapshotCodec::new(
            SnapshotCompression::with_default_level(CompressionMethod::Zstd).unwrap(),
            0.9,
        );
        let snapshot = large_snapshot();

        let record = codec.encode(&snapshot).unwrap();
        assert_eq!(record.compression, CompressionMethod::Zstd);

        let decoded = codec.decode(record).unwrap();
        assert_eq!(decoded, snapshot);
        assert!(decoded.verify());
    }

    #[test]
    fn mislabelled_record_falls_back_to_raw_state() {
        let codec = SnapshotCodec::default();
        let snapshot = large_snapshot();
        let mut record = codec.encode(&snapshot).unwrap();
        record.compression = CompressionMethod::Gzip;

        let decoded = codec.decode(record).unwrap();

        assert_eq!(decoded.state, snapshot.state);
    }

    #[test]
    fn undecodable_state_is_an_error() {
        let codec = SnapshotCodec::default();
        let mut record = codec.encode(&large_snapshot()).unwrap();
        record.compression = CompressionMethod::Gzip;
        record.state = vec![0xff, 0x00, 0x13];

        assert!(matches!(
            codec.decode(record),
            Err(SnapshotError::Decode { .. })
        ));
    }
}
