//! Hot/warm composition.
//!
//! Writes commit to the hot tier and are mirrored into the warm tier, either
//! inline or through a background queue. Reads are served from hot and fall
//! back to warm for aggregates the hot tier no longer (or never) held.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::{
    AggregateId, EventEnvelope, EventQuery, EventStoreError, Result, Version, VersionRange,
    store::{AppendOptions, EventStore, HotTier, WarmTier},
};

/// Attempts to commit a batch when hot keeps evicting the aggregate under it.
const HOT_APPEND_ATTEMPTS: u32 = 3;

/// How committed events reach the warm tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MirrorMode {
    /// `append` returns after the warm import was attempted.
    Sync,
    /// `append` returns once hot has committed; a background task imports.
    #[default]
    Async,
}

/// Configuration for [`TieredEventStore`].
#[derive(Debug, Clone)]
pub struct TieredConfig {
    pub mirror: MirrorMode,
    /// Hydrate hot with streams that had to be read from warm.
    pub read_through: bool,
    /// Import attempts per mirrored batch.
    pub mirror_attempts: u32,
    /// Delay before the first retry; doubled on each further attempt.
    pub retry_backoff: Duration,
}

impl Default for TieredConfig {
    fn default() -> Self {
        Self {
            mirror: MirrorMode::Async,
            read_through: true,
            mirror_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

enum MirrorCommand {
    Mirror(Vec<EventEnvelope>),
    Flush(oneshot::Sender<()>),
}

/// Imports into warm with bounded retries. Exhausted batches are counted, not surfaced.
struct Mirror<W: ?Sized> {
    warm: Arc<W>,
    attempts: u32,
    backoff: Duration,
    failures: Arc<AtomicU64>,
}

impl<W: WarmTier + ?Sized> Mirror<W> {
    async fn mirror(&self, events: Vec<EventEnvelope>) {
        let Some(first) = events.first() else {
            return;
        };
        let aggregate_id = first.aggregate_id;
        let attempts = self.attempts.max(1);

        for attempt in 1..=attempts {
            match self.warm.import_events(events.clone()).await {
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(%aggregate_id, attempt, error = %e, "warm mirror attempt failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff * 2u32.pow(attempt - 1)).await;
                    }
                }
            }
        }

        self.failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("event_store_mirror_failures_total").increment(1);
        tracing::error!(
            %aggregate_id,
            events = events.len(),
            "warm mirror gave up; archival will re-import before eviction"
        );
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<MirrorCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                MirrorCommand::Mirror(events) => self.mirror(events).await,
                MirrorCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    }
}

/// Event store composed of a hot tier in front of a durable warm tier.
pub struct TieredEventStore<H, W> {
    hot: Arc<H>,
    warm: Arc<W>,
    config: TieredConfig,
    mirror: Arc<Mirror<W>>,
    queue: Option<mpsc::UnboundedSender<MirrorCommand>>,
}

impl<H, W> TieredEventStore<H, W>
where
    H: HotTier + 'static,
    W: WarmTier + 'static,
{
    /// Creates a tiered store.
    ///
    /// With [`MirrorMode::Async`] this spawns the mirror worker and must be
    /// called within a tokio runtime. The worker stops when the store is dropped.
    pub fn new(hot: Arc<H>, warm: Arc<W>, config: TieredConfig) -> Self {
        let mirror = Arc::new(Mirror {
            warm: warm.clone(),
            attempts: config.mirror_attempts,
            backoff: config.retry_backoff,
            failures: Arc::new(AtomicU64::new(0)),
        });

        let queue = match config.mirror {
            MirrorMode::Sync => None,
            MirrorMode::Async => {
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = Mirror {
                    warm: warm.clone(),
                    attempts: config.mirror_attempts,
                    backoff: config.retry_backoff,
                    failures: mirror.failures.clone(),
                };
                tokio::spawn(worker.run(rx));
                Some(tx)
            }
        };

        Self {
            hot,
            warm,
            config,
            mirror,
            queue,
        }
    }

    pub fn hot(&self) -> &Arc<H> {
        &self.hot
    }

    pub fn warm(&self) -> &Arc<W> {
        &self.warm
    }

    pub fn config(&self) -> &TieredConfig {
        &self.config
    }

    /// Mirrored batches that were dropped after exhausting their retries.
    pub fn mirror_failures(&self) -> u64 {
        self.mirror.failures.load(Ordering::Relaxed)
    }

    /// Waits until every batch queued so far has been attempted.
    pub async fn flush_mirror(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if queue.send(MirrorCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Loads the warm stream into hot when hot has nothing for the aggregate.
    /// Returns warm's version and stream.
    ///
    /// Hot starts from warm's version even when older events were archived
    /// to cold storage, so their versions are never reused.
    async fn hydrate_from_warm(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<(Version, Vec<EventEnvelope>)> {
        let version = self.warm.get_aggregate_version(aggregate_id).await?;
        if version == Version::initial() {
            return Ok((version, Vec::new()));
        }
        let stream = self.warm.load(aggregate_id, VersionRange::all()).await?;
        tracing::debug!(%aggregate_id, %version, events = stream.len(), "hydrating hot tier from warm");
        self.hot.hydrate(aggregate_id, version, stream.clone()).await?;
        Ok((version, stream))
    }

    async fn in_hot(&self, aggregate_id: AggregateId) -> Result<bool> {
        Ok(self.hot.get_aggregate_version(aggregate_id).await? > Version::initial())
    }

    async fn dispatch_mirror(&self, events: Vec<EventEnvelope>) {
        match &self.queue {
            Some(queue) => {
                if let Err(mpsc::error::SendError(MirrorCommand::Mirror(events))) =
                    queue.send(MirrorCommand::Mirror(events))
                {
                    // worker gone; mirror inline instead of losing the batch
                    self.mirror.mirror(events).await;
                }
            }
            None => self.mirror.mirror(events).await,
        }
    }

    fn merge(
        hot: Vec<EventEnvelope>,
        warm: Vec<EventEnvelope>,
    ) -> Vec<EventEnvelope> {
        let mut merged: BTreeMap<(AggregateId, Version), EventEnvelope> = BTreeMap::new();
        for event in warm.into_iter().chain(hot) {
            merged.insert((event.aggregate_id, event.version), event);
        }
        let mut events: Vec<_> = merged.into_values().collect();
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.version.cmp(&b.version))
        });
        events
    }
}

#[async_trait]
impl<H, W> EventStore for TieredEventStore<H, W>
where
    H: HotTier + 'static,
    W: WarmTier + 'static,
{
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        aggregate_id: AggregateId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Version> {
        for attempt in 1..=HOT_APPEND_ATTEMPTS {
            // a known aggregate must still be resident when the batch commits,
            // otherwise hot would number it from scratch
            let resident = if self.in_hot(aggregate_id).await? {
                true
            } else {
                self.hydrate_from_warm(aggregate_id).await?.0 > Version::initial()
            };

            let Some(committed) = self
                .hot
                .append_committed(aggregate_id, events.clone(), options.clone(), resident)
                .await?
            else {
                tracing::debug!(%aggregate_id, attempt, "aggregate evicted from hot during append");
                continue;
            };

            let Some(new_version) = committed.last().map(|e| e.version) else {
                return self.get_aggregate_version(aggregate_id).await;
            };
            self.dispatch_mirror(committed).await;
            return Ok(new_version);
        }

        let actual = self.get_aggregate_version(aggregate_id).await?;
        Err(EventStoreError::ConcurrencyConflict {
            aggregate_id,
            expected: options.expected_version.unwrap_or(actual),
            actual,
        })
    }

    async fn load(
        &self,
        aggregate_id: AggregateId,
        range: VersionRange,
    ) -> Result<Vec<EventEnvelope>> {
        if self.in_hot(aggregate_id).await? {
            return self.hot.load(aggregate_id, range).await;
        }

        if self.config.read_through {
            let (_, stream) = self.hydrate_from_warm(aggregate_id).await?;
            return Ok(stream
                .into_iter()
                .filter(|e| range.contains(e.version))
                .collect());
        }

        self.warm.load(aggregate_id, range).await
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Version> {
        let hot = self.hot.get_aggregate_version(aggregate_id).await?;
        let warm = self.warm.get_aggregate_version(aggregate_id).await?;
        Ok(hot.max(warm))
    }

    async fn load_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>> {
        let hot = self.hot.load_events_by_type(event_type).await?;
        let warm = self.warm.load_events_by_type(event_type).await?;
        Ok(Self::merge(hot, warm))
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let unpaged = query.unpaged();
        let hot = self.hot.query_events(unpaged.clone()).await?;
        let warm = self.warm.query_events(unpaged).await?;
        Ok(query.paginate(Self::merge(hot, warm)))
    }
}
