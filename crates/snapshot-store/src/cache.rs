use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::Result;

/// Key/value cache with per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value`; `ttl` of `None` never expires.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Removes a key. Returns true if it was present.
    async fn forget(&self, key: &str) -> Result<bool>;

    /// Adds one to a counter, creating it with `ttl` if absent. Returns the new value.
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64>;
}

#[derive(Debug, Clone)]
enum CachedValue {
    Bytes(Vec<u8>),
    Counter(i64),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Writes between sweeps of expired entries.
const SWEEP_EVERY: u64 = 256;

type Entries = HashMap<String, CacheEntry>;

fn drop_expired(entries: &mut Entries, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, e| e.is_live(now));
    before - entries.len()
}

/// Process-local [`CacheBackend`].
///
/// Expired entries are dropped on read and swept every few writes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<RwLock<Entries>>,
    writes: Arc<AtomicU64>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let purged = drop_expired(&mut *self.entries.write().await, Instant::now());
        if purged > 0 {
            tracing::debug!(purged, "expired cache entries purged");
        }
        purged
    }

    fn sweep_if_due(&self, entries: &mut Entries, now: Instant) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            drop_expired(entries, now);
        }
    }
}

/// A TTL too large to represent never expires.
fn expiry(now: Instant, ttl: Option<Duration>) -> Option<Instant> {
    ttl.and_then(|ttl| now.checked_add(ttl))
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if entry.is_live(now) => {
                    return Ok(Some(match &entry.value {
                        CachedValue::Bytes(bytes) => bytes.clone(),
                        CachedValue::Counter(n) => n.to_string().into_bytes(),
                    }));
                }
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let entry = CacheEntry {
            value: CachedValue::Bytes(value),
            expires_at: expiry(now, ttl),
        };
        let mut entries = self.entries.write().await;
        self.sweep_if_due(&mut entries, now);
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        self.sweep_if_due(&mut entries, now);
        let current = match entries.get(key) {
            Some(entry) if entry.is_live(now) => match &entry.value {
                CachedValue::Counter(n) => Some((*n, entry.expires_at)),
                CachedValue::Bytes(bytes) => std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(|n| (n, entry.expires_at)),
            },
            _ => None,
        };

        let (value, expires_at) = match current {
            Some((n, expires_at)) => (n.saturating_add(1), expires_at),
            None => (1, expiry(now, ttl)),
        };
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: CachedValue::Counter(value),
                expires_at,
            },
        );
        Ok(value)
    }
}
