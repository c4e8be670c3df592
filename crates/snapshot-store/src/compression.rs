//! Snapshot state compression.
//!
//! Which codecs exist is decided at build time by the `gzip` and `zstd` cargo
//! features; asking for a method that was compiled out fails when the
//! [`SnapshotCompression`] is constructed, never on first use.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inputs smaller than this are never worth compressing.
pub const MIN_COMPRESSIBLE_BYTES: usize = 1024;

/// Errors raised by [`SnapshotCompression`].
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Compression method {0} is not supported by this build")]
    UnsupportedMethod(String),

    #[error("Compression level {level} is out of range for {method}")]
    InvalidLevel { method: CompressionMethod, level: i32 },

    #[error("{method} codec failed: {source}")]
    Codec {
        method: CompressionMethod,
        #[source]
        source: std::io::Error,
    },
}

/// Codec applied to serialized snapshot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    #[default]
    None,
    Gzip,
    Deflate,
    /// High-ratio codec, used where a bzip2-class ratio is wanted.
    Zstd,
}

impl CompressionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Gzip => "gzip",
            CompressionMethod::Deflate => "deflate",
            CompressionMethod::Zstd => "zstd",
        }
    }

    /// File extension used for blobs written with this method.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionMethod::None => "raw",
            CompressionMethod::Gzip => "gz",
            CompressionMethod::Deflate => "deflate",
            CompressionMethod::Zstd => "zst",
        }
    }

    /// Inverse of [`CompressionMethod::extension`].
    pub fn from_extension(ext: &str) -> Option<Self> {
        [
            CompressionMethod::None,
            CompressionMethod::Gzip,
            CompressionMethod::Deflate,
            CompressionMethod::Zstd,
        ]
        .into_iter()
        .find(|m| m.extension() == ext)
    }

    /// Whether this build carries the codec.
    pub fn is_supported(&self) -> bool {
        match self {
            CompressionMethod::None => true,
            CompressionMethod::Gzip | CompressionMethod::Deflate => cfg!(feature = "gzip"),
            CompressionMethod::Zstd => cfg!(feature = "zstd"),
        }
    }

    /// Accepted compression levels.
    pub fn levels(&self) -> RangeInclusive<i32> {
        match self {
            CompressionMethod::None => 0..=0,
            CompressionMethod::Gzip | CompressionMethod::Deflate => 0..=9,
            CompressionMethod::Zstd => 1..=22,
        }
    }

    pub fn default_level(&self) -> i32 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Gzip | CompressionMethod::Deflate => 6,
            CompressionMethod::Zstd => 3,
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionMethod {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionMethod::None),
            "gzip" => Ok(CompressionMethod::Gzip),
            "deflate" => Ok(CompressionMethod::Deflate),
            "zstd" => Ok(CompressionMethod::Zstd),
            other => Err(CompressionError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// Size comparison for one compression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompressionStats {
    pub method: CompressionMethod,
    pub original_size: usize,
    pub compressed_size: usize,
    /// `compressed_size / original_size`; below 1.0 means the codec helped.
    pub ratio: f64,
    /// Negative when compression grew the data.
    pub bytes_saved: i64,
    pub percent_saved: f64,
}

/// A validated codec and level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCompression {
    method: CompressionMethod,
    level: i32,
}

impl Default for SnapshotCompression {
    fn default() -> Self {
        Self::none()
    }
}

impl SnapshotCompression {
    /// Validates `method` against this build and `level` against the method's range.
    pub fn new(method: CompressionMethod, level: i32) -> Result<Self, CompressionError> {
        if !method.is_supported() {
            return Err(CompressionError::UnsupportedMethod(method.to_string()));
        }
        if !method.levels().contains(&level) {
            return Err(CompressionError::InvalidLevel { method, level });
        }
        Ok(Self { method, level })
    }

    pub fn with_default_level(method: CompressionMethod) -> Result<Self, CompressionError> {
        Self::new(method, method.default_level())
    }

    /// Pass-through codec.
    pub fn none() -> Self {
        Self {
            method: CompressionMethod::None,
            level: 0,
        }
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        encode(self.method, self.level, data)
    }

    /// Decompresses with this codec, or with `method_override` when the data
    /// was written by a different one.
    pub fn decompress(
        &self,
        data: &[u8],
        method_override: Option<CompressionMethod>,
    ) -> Result<Vec<u8>, CompressionError> {
        let method = method_override.unwrap_or(self.method);
        if !method.is_supported() {
            return Err(CompressionError::UnsupportedMethod(method.to_string()));
        }
        decode(method, data)
    }

    /// Compresses `data` and returns the result only if it is at least
    /// [`MIN_COMPRESSIBLE_BYTES`] long and the achieved ratio is below `min_ratio`.
    pub fn compress_if_worthwhile(
        &self,
        data: &[u8],
        min_ratio: f64,
    ) -> Result<Option<Vec<u8>>, CompressionError> {
        if self.method == CompressionMethod::None || data.len() < MIN_COMPRESSIBLE_BYTES {
            return Ok(None);
        }
        let compressed = self.compress(data)?;
        let ratio = compressed.len() as f64 / data.len() as f64;
        Ok((ratio < min_ratio).then_some(compressed))
    }

    /// Whether compressing `data` would beat `min_ratio`.
    pub fn should_compress(&self, data: &[u8], min_ratio: f64) -> bool {
        matches!(self.compress_if_worthwhile(data, min_ratio), Ok(Some(_)))
    }

    pub fn stats(&self, original_size: usize, compressed_size: usize) -> CompressionStats {
        let ratio = if original_size == 0 {
            1.0
        } else {
            compressed_size as f64 / original_size as f64
        };
        CompressionStats {
            method: self.method,
            original_size,
            compressed_size,
            ratio,
            bytes_saved: original_size as i64 - compressed_size as i64,
            percent_saved: (1.0 - ratio) * 100.0,
        }
    }
}

fn codec_error(method: CompressionMethod) -> impl FnOnce(std::io::Error) -> CompressionError {
    move |source| CompressionError::Codec { method, source }
}

fn encode(method: CompressionMethod, level: i32, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        #[cfg(feature = "gzip")]
        CompressionMethod::Gzip => {
            use std::io::Write;
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level as u32));
            encoder.write_all(data).map_err(codec_error(method))?;
            encoder.finish().map_err(codec_error(method))
        }
        #[cfg(feature = "gzip")]
        CompressionMethod::Deflate => {
            use std::io::Write;
            let mut encoder = flate2::write::DeflateEncoder::new(
                Vec::new(),
                flate2::Compression::new(level as u32),
            );
            encoder.write_all(data).map_err(codec_error(method))?;
            encoder.finish().map_err(codec_error(method))
        }
        #[cfg(feature = "zstd")]
        CompressionMethod::Zstd => zstd::stream::encode_all(data, level).map_err(codec_error(method)),
        #[allow(unreachable_patterns)]
        other => {
            let _ = level;
            Err(CompressionError::UnsupportedMethod(other.to_string()))
        }
    }
}

fn decode(method: CompressionMethod, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        #[cfg(feature = "gzip")]
        CompressionMethod::Gzip => {
            use std::io::Read;
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(codec_error(method))?;
            Ok(out)
        }
        #[cfg(feature = "gzip")]
        CompressionMethod::Deflate => {
            use std::io::Read;
            let mut out = Vec::new();
            flate2::read::DeflateDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(codec_error(method))?;
            Ok(out)
        }
        #[cfg(feature = "zstd")]
        CompressionMethod::Zstd => zstd::stream::decode_all(data).map_err(codec_error(method)),
        #[allow(unreachable_patterns)]
        other => Err(CompressionError::UnsupportedMethod(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supported_methods() -> Vec<CompressionMethod> {
        [
            CompressionMethod::None,
            CompressionMethod::Gzip,
            CompressionMethod::Deflate,
            CompressionMethod::Zstd,
        ]
        .into_iter()
        .filter(|m| m.is_supported())
        .collect()
    }

    /// Deterministic pseudo-random bytes.
    fn noise(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn repetitive_json(len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            out.extend_from_slice(br#"{"item":"widget","quantity":1,"price_cents":995},"#);
        }
        out
    }

    #[test]
    fn round_trip_for_every_supported_method() {
        for method in supported_methods() {
            let codec = SnapshotCompression::with_default_level(method).unwrap();
            for (i, data) in [noise(4096, 7), repetitive_json(2048), noise(1024, 99)]
                .into_iter()
                .enumerate()
            {
                let compressed = codec.compress(&data).unwrap();
                let restored = codec.decompress(&compressed, None).unwrap();
                assert_eq!(restored, data, "{method} payload {i}");
            }
        }
    }

    #[test]
    fn small_payloads_are_not_worth_compressing() {
        for method in supported_methods() {
            let codec = SnapshotCompression::with_default_level(method).unwrap();
            assert!(!codec.should_compress(&repetitive_json(512)[..512], 0.9));
            assert!(!codec.should_compress(&[], 0.9));
        }
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn compressible_payload_beats_ratio_but_noise_does_not() {
        let codec = SnapshotCompression::with_default_level(CompressionMethod::Gzip).unwrap();

        assert!(codec.should_compress(&repetitive_json(8192), 0.5));
        assert!(!codec.should_compress(&noise(8192, 3), 0.9));
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn decompress_honours_override() {
        let zstd = SnapshotCompression::with_default_level(CompressionMethod::Zstd).unwrap();
        let compressed = zstd.compress(&repetitive_json(2048)).unwrap();

        let reader = SnapshotCompression::none();
        let restored = reader
            .decompress(&compressed, Some(CompressionMethod::Zstd))
            .unwrap();

        assert_eq!(restored, repetitive_json(2048));
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn corrupt_input_is_a_codec_error() {
        let codec = SnapshotCompression::with_default_level(CompressionMethod::Gzip).unwrap();
        let result = codec.decompress(b"definitely not gzip", None);
        assert!(matches!(result, Err(CompressionError::Codec { .. })));
    }

    #[test]
    fn invalid_level_rejected_at_construction() {
        assert!(matches!(
            SnapshotCompression::new(CompressionMethod::Gzip, 12),
            Err(CompressionError::InvalidLevel { level: 12, .. })
                | Err(CompressionError::UnsupportedMethod(_))
        ));
        assert!(matches!(
            SnapshotCompression::new(CompressionMethod::Zstd, 0),
            Err(CompressionError::InvalidLevel { .. }) | Err(CompressionError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn parses_method_names() {
        assert_eq!("GZIP".parse::<CompressionMethod>().unwrap(), CompressionMethod::Gzip);
        assert_eq!("none".parse::<CompressionMethod>().unwrap(), CompressionMethod::None);
        assert!(matches!(
            "bzip2".parse::<CompressionMethod>(),
            Err(CompressionError::UnsupportedMethod(name)) if name == "bzip2"
        ));
    }

    #[test]
    fn extensions_round_trip() {
        for method in supported_methods() {
            assert_eq!(CompressionMethod::from_extension(method.extension()), Some(method));
        }
        assert_eq!(CompressionMethod::from_extension("bz2"), None);
    }

    #[test]
    fn stats_report_savings() {
        let codec = SnapshotCompression::none();
        let stats = codec.stats(2000, 500);

        assert_eq!(stats.bytes_saved, 1500);
        assert!((stats.ratio - 0.25).abs() < f64::EPSILON);
        assert!((stats.percent_saved - 75.0).abs() < 1e-9);
    }
}
