//! When to take a snapshot.
//!
//! Three strategies are offered as a closed set:
//!
//! * [`SimpleSnapshotStrategy`] snapshots every `threshold` events.
//! * [`TimeBasedStrategy`] snapshots once the last one is older than an interval.
//! * [`AdaptiveSnapshotStrategy`] weighs event count, elapsed time, state
//!   complexity, load-time and access trends, and system load.
//!
//! Every strategy only fires when at least one event has been applied since
//! the last snapshot.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Clock, SystemClock};
use serde::{Deserialize, Serialize};

use crate::{AggregateId, AggregateSnapshot, SnapshotError, Version, error::Result};

/// Shortest interval a [`TimeBasedStrategy`] accepts.
pub const MIN_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// Longest access history an [`AdaptiveSnapshotStrategy`] keeps.
pub const MAX_ACCESS_HISTORY: Duration = Duration::from_secs(30 * 24 * 3600);

/// Recorded loads and accesses between sweeps of idle aggregates.
const ACTIVITY_SWEEP_EVERY: u32 = 256;

/// The aggregate as seen at a decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCandidate {
    pub aggregate_id: AggregateId,
    /// Version after the most recent append.
    pub version: Version,
    /// Serialized state size in bytes, if known.
    pub state_size: usize,
}

impl SnapshotCandidate {
    pub fn new(aggregate_id: AggregateId, version: Version) -> Self {
        Self {
            aggregate_id,
            version,
            state_size: 0,
        }
    }

    pub fn with_state_size(mut self, bytes: usize) -> Self {
        self.state_size = bytes;
        self
    }

    /// Events applied since `last`, or since the beginning without one.
    pub fn events_since(&self, last: Option<&AggregateSnapshot>) -> i64 {
        match last {
            Some(snapshot) => self.version.distance_from(snapshot.version),
            None => self.version.as_i64(),
        }
    }
}

/// Snapshots once a fixed number of events has accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleSnapshotStrategy {
    threshold: i64,
}

impl SimpleSnapshotStrategy {
    pub fn new(threshold: i64) -> Result<Self> {
        if threshold <= 0 {
            return Err(SnapshotError::InvalidConfiguration(format!(
                "snapshot threshold must be positive, got {threshold}"
            )));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    pub fn should_snapshot(
        &self,
        candidate: &SnapshotCandidate,
        last: Option<&AggregateSnapshot>,
    ) -> bool {
        candidate.events_since(last) >= self.threshold
    }
}

/// Snapshots when the last snapshot is older than `interval`.
#[derive(Clone)]
pub struct TimeBasedStrategy {
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TimeBasedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeBasedStrategy")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl TimeBasedStrategy {
    pub fn new(interval: Duration) -> Result<Self> {
        if interval < MIN_SNAPSHOT_INTERVAL {
            return Err(SnapshotError::InvalidConfiguration(format!(
                "snapshot interval must be at least {}s, got {}s",
                MIN_SNAPSHOT_INTERVAL.as_secs(),
                interval.as_secs()
            )));
        }
        Ok(Self {
            interval,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn should_snapshot(
        &self,
        candidate: &SnapshotCandidate,
        last: Option<&AggregateSnapshot>,
    ) -> bool {
        if candidate.events_since(last) <= 0 {
            return false;
        }
        match last {
            None => true,
            Some(snapshot) => elapsed_since(self.clock.as_ref(), snapshot.created_at) > self.interval,
        }
    }
}

fn elapsed_since(clock: &dyn Clock, at: DateTime<Utc>) -> Duration {
    (clock.now() - at).to_std().unwrap_or(Duration::ZERO)
}

/// Tuning for [`AdaptiveSnapshotStrategy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Event count threshold before weighting and load adjustment.
    pub base_threshold: u64,
    pub min_threshold: u64,
    pub max_threshold: u64,
    /// Snapshot when the last one is at least this old.
    pub time_interval_secs: u64,
    /// Complexity score at which a snapshot is taken regardless of count.
    pub complexity_trigger: f64,
    pub event_count_weight: f64,
    pub complexity_weight: f64,
    pub access_weight: f64,
    /// Accesses per hour considered fully hot.
    pub hot_access_rate: f64,
    /// Multiplicative step applied to the load factor per adjustment.
    pub load_step: f64,
    /// Number of recent load-time samples compared against the older baseline.
    pub load_window: usize,
    /// Width of the "recent" access window, in seconds.
    pub access_window_secs: u64,
    /// How far back access history is kept, in seconds.
    pub access_history_secs: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            base_threshold: 100,
            min_threshold: 10,
            max_threshold: 1000,
            time_interval_secs: 3600,
            complexity_trigger: 12.0,
            event_count_weight: 0.4,
            complexity_weight: 0.3,
            access_weight: 0.3,
            hot_access_rate: 60.0,
            load_step: 1.2,
            load_window: 5,
            access_window_secs: 300,
            access_history_secs: 3600,
        }
    }
}

impl AdaptiveConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SnapshotError::InvalidConfiguration(msg.to_string()));

        if self.min_threshold == 0 || self.min_threshold > self.max_threshold {
            return invalid("adaptive thresholds require 0 < min_threshold <= max_threshold");
        }
        let weights = [
            self.event_count_weight,
            self.complexity_weight,
            self.access_weight,
        ];
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) || weights.iter().sum::<f64>() <= 0.0
        {
            return invalid("adaptive weights must be non-negative with a positive sum");
        }
        if !(self.load_step.is_finite() && self.load_step > 1.0) {
            return invalid("load_step must be a finite number greater than 1");
        }
        let positive = |x: f64| x.is_finite() && x > 0.0;
        if !positive(self.complexity_trigger) || !positive(self.hot_access_rate) {
            return invalid("complexity_trigger and hot_access_rate must be positive and finite");
        }
        if self.load_window == 0 || self.access_window_secs >= self.access_history_secs {
            return invalid("load_window must be positive and access_window shorter than history");
        }
        if Duration::from_secs(self.access_history_secs) > MAX_ACCESS_HISTORY {
            return invalid("access_history_secs must be at most 30 days");
        }
        if Duration::from_secs(self.time_interval_secs) < MIN_SNAPSHOT_INTERVAL {
            return invalid("time_interval_secs must be at least 60");
        }
        Ok(())
    }
}

/// Host resource utilisation, each in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemLoad {
    pub cpu: f64,
    pub memory: f64,
    pub disk_io: f64,
}

impl SystemLoad {
    const BUSY: f64 = 0.8;
    const IDLE: f64 = 0.3;

    fn peak(&self) -> f64 {
        self.cpu.max(self.memory).max(self.disk_io)
    }
}

#[derive(Debug)]
struct AggregateActivity {
    load_times: VecDeque<Duration>,
    accesses: VecDeque<DateTime<Utc>>,
    last_seen: DateTime<Utc>,
}

impl AggregateActivity {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            load_times: VecDeque::new(),
            accesses: VecDeque::new(),
            last_seen: now,
        }
    }
}

#[derive(Debug)]
struct AdaptiveState {
    load_factor: f64,
    activity: HashMap<AggregateId, AggregateActivity>,
    since_sweep: u32,
}

impl AdaptiveState {
    fn sweep(&mut self, horizon: DateTime<Utc>) -> usize {
        self.since_sweep = 0;
        let before = self.activity.len();
        self.activity.retain(|_, a| a.last_seen >= horizon);
        before - self.activity.len()
    }

    /// The aggregate's activity, marked as seen at `now`. Sweeps idle
    /// aggregates every few calls.
    fn touch(
        &mut self,
        aggregate_id: AggregateId,
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
    ) -> &mut AggregateActivity {
        self.since_sweep += 1;
        if self.since_sweep >= ACTIVITY_SWEEP_EVERY {
            self.sweep(horizon);
        }
        let activity = self
            .activity
            .entry(aggregate_id)
            .or_insert_with(|| AggregateActivity::new(now));
        activity.last_seen = now;
        activity
    }
}

/// Why an adaptive decision fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveTrigger {
    EventCount,
    Elapsed,
    Complexity,
    LoadTimeDegradation,
    AccessSurge,
}

fn mean_secs<'a>(samples: impl Iterator<Item = &'a Duration>) -> f64 {
    let (sum, count) = samples.fold((0.0, 0usize), |(sum, count), d| {
        (sum + d.as_secs_f64(), count + 1)
    });
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// Snapshot strategy that adapts its threshold to the aggregate and the host.
pub struct AdaptiveSnapshotStrategy {
    config: AdaptiveConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<AdaptiveState>,
}

impl fmt::Debug for AdaptiveSnapshotStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveSnapshotStrategy")
            .field("config", &self.config)
            .field("load_factor", &self.load_factor())
            .finish_non_exhaustive()
    }
}

impl AdaptiveSnapshotStrategy {
    const MIN_LOAD_FACTOR: f64 = 0.25;
    const MAX_LOAD_FACTOR: f64 = 4.0;
    const DEGRADATION_FACTOR: f64 = 1.5;
    const SURGE_FACTOR: f64 = 2.0;

    pub fn new(config: AdaptiveConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock: Arc::new(SystemClock),
            state: Mutex::new(AdaptiveState {
                load_factor: 1.0,
                activity: HashMap::new(),
                since_sweep: 0,
            }),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AdaptiveState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn load_factor(&self) -> f64 {
        self.lock().load_factor
    }

    fn history_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::seconds(self.config.access_history_secs as i64)
    }

    /// Aggregates with load or access samples.
    pub fn tracked_aggregates(&self) -> usize {
        self.lock().activity.len()
    }

    /// Forgets aggregates not seen within the access history. Returns how many.
    pub fn prune_inactive(&self) -> usize {
        let horizon = self.history_start(self.clock.now());
        self.lock().sweep(horizon)
    }

    /// Raises the threshold under load and lowers it when the host is idle.
    pub fn adjust_for_system_load(&self, load: SystemLoad) {
        let mut state = self.lock();
        let peak = load.peak();
        if peak > SystemLoad::BUSY {
            state.load_factor *= self.config.load_step;
        } else if peak < SystemLoad::IDLE {
            state.load_factor /= self.config.load_step;
        }
        state.load_factor = state
            .load_factor
            .clamp(Self::MIN_LOAD_FACTOR, Self::MAX_LOAD_FACTOR);
        tracing::debug!(load_factor = state.load_factor, peak, "adaptive load factor adjusted");
    }

    /// Records how long reconstructing the aggregate took.
    pub fn record_load(&self, aggregate_id: AggregateId, elapsed: Duration) {
        let keep = self.config.load_window * 2;
        let now = self.clock.now();
        let horizon = self.history_start(now);
        let mut state = self.lock();
        let activity = state.touch(aggregate_id, now, horizon);
        activity.load_times.push_back(elapsed);
        while activity.load_times.len() > keep {
            activity.load_times.pop_front();
        }
    }

    /// Records one access to the aggregate.
    pub fn record_access(&self, aggregate_id: AggregateId) {
        let now = self.clock.now();
        let horizon = self.history_start(now);
        let mut state = self.lock();
        let activity = state.touch(aggregate_id, now, horizon);
        activity.accesses.push_back(now);
        while activity.accesses.front().is_some_and(|at| *at < horizon) {
            activity.accesses.pop_front();
        }
    }

    /// Log-scaled complexity of an aggregate from its state size and event count.
    pub fn complexity_score(state_size: usize, event_count: i64) -> f64 {
        let kib = state_size as f64 / 1024.0;
        (1.0 + kib).log2() + (1.0 + event_count.max(0) as f64).log10()
    }

    /// Event-count threshold for this candidate, clamped to the configured bounds.
    pub fn adaptive_threshold(&self, candidate: &SnapshotCandidate) -> u64 {
        let access_rate = self.access_rate_per_hour(candidate.aggregate_id).0;
        let complexity = Self::complexity_score(candidate.state_size, candidate.version.as_i64());
        let load_factor = self.load_factor();
        self.threshold_from(complexity, access_rate, load_factor)
    }

    fn threshold_from(&self, complexity: f64, access_rate: f64, load_factor: f64) -> u64 {
        let cfg = &self.config;
        let complexity_pressure = (complexity / cfg.complexity_trigger).min(1.0);
        let access_pressure = (access_rate / cfg.hot_access_rate).min(1.0);
        let weights = cfg.event_count_weight + cfg.complexity_weight + cfg.access_weight;
        let relief = (cfg.complexity_weight * complexity_pressure
            + cfg.access_weight * access_pressure)
            / weights;

        let raw = cfg.base_threshold as f64 * load_factor * (1.0 - relief);
        (raw.round().max(0.0) as u64).clamp(cfg.min_threshold, cfg.max_threshold)
    }

    /// Recent and historical access rates, per hour.
    fn access_rate_per_hour(&self, aggregate_id: AggregateId) -> (f64, f64) {
        let now = self.clock.now();
        let recent_secs = self.config.access_window_secs as i64;
        let history_secs = self.config.access_history_secs as i64;
        let recent_start = now - chrono::Duration::seconds(recent_secs);
        let history_start = self.history_start(now);

        let state = self.lock();
        let Some(activity) = state.activity.get(&aggregate_id) else {
            return (0.0, 0.0);
        };
        let recent = activity
            .accesses
            .iter()
            .filter(|at| **at >= recent_start)
            .count() as f64;
        let older = activity
            .accesses
            .iter()
            .filter(|at| **at >= history_start && **at < recent_start)
            .count() as f64;

        let per_hour = |count: f64, secs: i64| count * 3600.0 / secs as f64;
        (
            per_hour(recent, recent_secs),
            per_hour(older, history_secs - recent_secs),
        )
    }

    fn load_time_degraded(&self, aggregate_id: AggregateId) -> bool {
        let window = self.config.load_window;
        let state = self.lock();
        let Some(activity) = state.activity.get(&aggregate_id) else {
            return false;
        };
        let samples = &activity.load_times;
        if samples.len() <= window {
            return false;
        }
        let split = samples.len() - window;
        let baseline = mean_secs(samples.iter().take(split));
        let recent = mean_secs(samples.iter().skip(split));
        baseline > 0.0 && recent > baseline * Self::DEGRADATION_FACTOR
    }

    /// The first condition that calls for a snapshot, if any.
    pub fn trigger(
        &self,
        candidate: &SnapshotCandidate,
        last: Option<&AggregateSnapshot>,
    ) -> Option<AdaptiveTrigger> {
        let events_since = candidate.events_since(last);
        if events_since <= 0 {
            return None;
        }

        if events_since as u64 >= self.adaptive_threshold(candidate) {
            return Some(AdaptiveTrigger::EventCount);
        }
        if let Some(snapshot) = last
            && elapsed_since(self.clock.as_ref(), snapshot.created_at)
                >= Duration::from_secs(self.config.time_interval_secs)
        {
            return Some(AdaptiveTrigger::Elapsed);
        }
        if Self::complexity_score(candidate.state_size, candidate.version.as_i64())
            >= self.config.complexity_trigger
        {
            return Some(AdaptiveTrigger::Complexity);
        }
        if self.load_time_degraded(candidate.aggregate_id) {
            return Some(AdaptiveTrigger::LoadTimeDegradation);
        }
        let (recent, historical) = self.access_rate_per_hour(candidate.aggregate_id);
        if historical > 0.0 && recent > historical * Self::SURGE_FACTOR {
            return Some(AdaptiveTrigger::AccessSurge);
        }
        None
    }

    pub fn should_snapshot(
        &self,
        candidate: &SnapshotCandidate,
        last: Option<&AggregateSnapshot>,
    ) -> bool {
        match self.trigger(candidate, last) {
            Some(trigger) => {
                tracing::debug!(aggregate_id = %candidate.aggregate_id, ?trigger, "adaptive snapshot triggered");
                true
            }
            None => false,
        }
    }
}

/// The snapshot strategy in use for a repository.
#[derive(Debug)]
pub enum SnapshotStrategy {
    Simple(SimpleSnapshotStrategy),
    TimeBased(TimeBasedStrategy),
    Adaptive(AdaptiveSnapshotStrategy),
}

impl SnapshotStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            SnapshotStrategy::Simple(_) => "simple",
            SnapshotStrategy::TimeBased(_) => "time_based",
            SnapshotStrategy::Adaptive(_) => "adaptive",
        }
    }

    pub fn should_snapshot(
        &self,
        candidate: &SnapshotCandidate,
        last: Option<&AggregateSnapshot>,
    ) -> bool {
        match self {
            SnapshotStrategy::Simple(s) => s.should_snapshot(candidate, last),
            SnapshotStrategy::TimeBased(s) => s.should_snapshot(candidate, last),
            SnapshotStrategy::Adaptive(s) => s.should_snapshot(candidate, last),
        }
    }

    /// Feeds a reconstruction time to strategies that track it.
    pub fn record_load(&self, aggregate_id: AggregateId, elapsed: Duration) {
        if let SnapshotStrategy::Adaptive(s) = self {
            s.record_load(aggregate_id, elapsed);
        }
    }

    /// Feeds an access to strategies that track it.
    pub fn record_access(&self, aggregate_id: AggregateId) {
        if let SnapshotStrategy::Adaptive(s) = self {
            s.record_access(aggregate_id);
        }
    }
}

/// Serializable description of a [`SnapshotStrategy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SnapshotStrategyConfig {
    Simple { threshold: i64 },
    TimeBased { interval_secs: u64 },
    Adaptive(AdaptiveConfig),
}

impl Default for SnapshotStrategyConfig {
    fn default() -> Self {
        SnapshotStrategyConfig::Simple { threshold: 100 }
    }
}

impl SnapshotStrategyConfig {
    /// Validates the configuration and builds the strategy.
    pub fn build(&self) -> Result<SnapshotStrategy> {
        self.build_with_clock(Arc::new(SystemClock))
    }

    pub fn build_with_clock(&self, clock: Arc<dyn Clock>) -> Result<SnapshotStrategy> {
        Ok(match self {
            SnapshotStrategyConfig::Simple { threshold } => {
                SnapshotStrategy::Simple(SimpleSnapshotStrategy::new(*threshold)?)
            }
            SnapshotStrategyConfig::TimeBased { interval_secs } => SnapshotStrategy::TimeBased(
                TimeBasedStrategy::new(Duration::from_secs(*interval_secs))?.with_clock(clock),
            ),
            SnapshotStrategyConfig::Adaptive(config) => SnapshotStrategy::Adaptive(
                AdaptiveSnapshotStrategy::new(config.clone())?.with_clock(clock),
            ),
        })
    }
}
