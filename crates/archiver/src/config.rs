//! Application configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use archival::ArchivalConfig;
use snapshot_store::CompressionMethod;

/// Server and worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default `"0.0.0.0"`)
/// - `PORT`: listen port (default `3000`)
/// - `RUST_LOG`: tracing filter directive (default `"info"`)
/// - `DATABASE_URL`: Postgres warm tier and snapshot store; in-memory when unset
/// - `ARCHIVE_DIR`: cold tier root directory (default `"./archive"`)
/// - `HOT_RETENTION_HOURS`: idle time before hot aggregates move to warm (default `24`)
/// - `WARM_RETENTION_DAYS`: partition age before it moves to cold (default `90`)
/// - `ARCHIVAL_INTERVAL_SECS`: pause between background passes, `0` disables them (default `3600`)
/// - `ARCHIVE_COMPRESSION`: `none`, `gzip`, `deflate` or `zstd` (default `gzip`)
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub archive_dir: PathBuf,
    pub hot_retention_hours: u32,
    pub warm_retention_days: u32,
    pub archival_interval: Duration,
    pub compression: CompressionMethod,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            archive_dir: lookup("ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.archive_dir),
            hot_retention_hours: parse(&lookup, "HOT_RETENTION_HOURS")
                .unwrap_or(defaults.hot_retention_hours),
            warm_retention_days: parse(&lookup, "WARM_RETENTION_DAYS")
                .unwrap_or(defaults.warm_retention_days),
            archival_interval: parse(&lookup, "ARCHIVAL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.archival_interval),
            compression: parse(&lookup, "ARCHIVE_COMPRESSION").unwrap_or(defaults.compression),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn archival(&self) -> ArchivalConfig {
        ArchivalConfig {
            hot_retention_hours: self.hot_retention_hours,
            warm_retention_days: self.warm_retention_days,
            compression: self.compression,
            ..ArchivalConfig::default()
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        let archival = ArchivalConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            archive_dir: PathBuf::from("./archive"),
            hot_retention_hours: archival.hot_retention_hours,
            warm_retention_days: archival.warm_retention_days,
            archival_interval: Duration::from_secs(3600),
            compression: archival.compression,
        }
    }
}
