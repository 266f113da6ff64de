//! Sliding per-week payload cache
//!
//! Holds one immutable [`WeekPayload`] per ISO week for a single user
//! session. Missing weeks are fetched on demand, concurrently, with at most
//! one fetch in flight per week: concurrent requests for the same week await
//! the same initialization. Weeks are never refetched once cached.
//!
//! Features:
//! - per-week insert-if-absent guard (no cache-wide lock across a fetch)
//! - bounded retries with linear backoff per week
//! - partial-failure reporting per week key
//! - neighbor prefetch on a background task
//! - cache hit/miss metrics
//! - optional distance-based eviction

use crate::error::{FetchError, Result, SpanError};
use crate::fetch::WeekFetcher;
use crate::models::{HrvRecord, Sample, SampleMetric, SleepInterval, WeekKey, WeekPayload};
use crate::navigator::PrefetchSink;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cache behaviour settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Attempts per week fetch before reporting failure
    pub retry_attempts: u32,

    /// Backoff unit between attempts (multiplied by the attempt number)
    pub retry_backoff_ms: u64,

    /// Evict cached weeks further than this from the displayed week.
    /// `None` keeps every week for the whole session.
    pub max_week_distance: Option<u32>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff_ms: 200,
            max_week_distance: None,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub fetch_attempts: u64,
    pub fetch_failures: u64,
    pub evictions: u64,
}

impl CacheMetrics {
    /// Get hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            return 0.0;
        }
        (self.hits as f64 / self.lookups as f64) * 100.0
    }
}

#[derive(Debug, Default)]
struct Counters {
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    fetch_attempts: AtomicU64,
    fetch_failures: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetch_attempts: self.fetch_attempts.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Emitted whenever a week could not be loaded
#[derive(Debug, Clone, PartialEq)]
pub struct CacheMissEvent {
    pub week: WeekKey,
    pub error: FetchError,
}

/// Outcome of an [`SlidingWeekCache::ensure_weeks`] batch
#[derive(Debug, Default)]
pub struct EnsureReport {
    /// Weeks now present in the cache
    pub ready: Vec<WeekKey>,

    /// Weeks whose fetch failed after all retries
    pub failed: Vec<(WeekKey, FetchError)>,
}

impl EnsureReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Cached data restricted to `[start, end)`, each field in timestamp order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeSlice {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bpm: Vec<Sample>,
    pub step: Vec<Sample>,
    pub calorie: Vec<Sample>,
    pub sleep: Vec<SleepInterval>,
    pub hrv: Vec<HrvRecord>,

    /// Overlapping weeks that failed to load; their data is absent
    pub missing_weeks: Vec<WeekKey>,
}

impl RangeSlice {
    fn empty(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            bpm: Vec::new(),
            step: Vec::new(),
            calorie: Vec::new(),
            sleep: Vec::new(),
            hrv: Vec::new(),
            missing_weeks: Vec::new(),
        }
    }

    pub fn samples(&self, metric: SampleMetric) -> &[Sample] {
        match metric {
            SampleMetric::HeartRate => &self.bpm,
            SampleMetric::Steps => &self.step,
            SampleMetric::Calories => &self.calorie,
        }
    }

    /// Add the part of `payload` inside the range. Sleep intervals starting
    /// before `sleep_floor` were already taken from the preceding week.
    fn extend_from(&mut self, payload: &WeekPayload, sleep_floor: Option<DateTime<Utc>>) {
        let (start, end) = (self.start, self.end);
        let in_range = |t: DateTime<Utc>| t >= start && t < end;
        let not_taken = |i: &SleepInterval| sleep_floor.map_or(true, |floor| i.start >= floor);

        self.bpm.extend(payload.bpm.iter().filter(|s| in_range(s.timestamp)));
        self.step.extend(payload.step.iter().filter(|s| in_range(s.timestamp)));
        self.calorie
            .extend(payload.calorie.iter().filter(|s| in_range(s.timestamp)));
        self.sleep.extend(
            payload
                .sleep
                .iter()
                .filter(|i| i.overlaps(start, end) && not_taken(i)),
        );
        self.hrv
            .extend(payload.hrv.iter().filter(|r| in_range(r.window_start)));
    }

    fn sort(&mut self) {
        self.bpm.sort_by_key(|s| s.timestamp);
        self.step.sort_by_key(|s| s.timestamp);
        self.calorie.sort_by_key(|s| s.timestamp);
        self.sleep.sort_by_key(|i| i.start);
        self.hrv.sort_by_key(|r| r.window_start);
    }
}

type WeekOutcome = std::result::Result<Arc<WeekPayload>, FetchError>;

/// One week's entry.
///
/// `gate` admits one fetch at a time and keeps the last failure. `failures`
/// counts finished failed fetches, so a caller queued behind one receives
/// its error instead of starting another.
#[derive(Debug, Default)]
struct WeekSlot {
    payload: OnceCell<Arc<WeekPayload>>,
    gate: Mutex<Option<FetchError>>,
    failures: AtomicU64,
}

type Slot = Arc<WeekSlot>;

/// Per-session week cache
pub struct SlidingWeekCache {
    user: String,
    fetcher: Arc<dyn WeekFetcher>,
    config: CacheConfig,
    offset: FixedOffset,
    slots: DashMap<WeekKey, Slot>,
    counters: Counters,
    misses: broadcast::Sender<CacheMissEvent>,
}

impl std::fmt::Debug for SlidingWeekCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWeekCache")
            .field("user", &self.user)
            .field("config", &self.config)
            .field("offset", &self.offset)
            .field("weeks", &self.slots.len())
            .finish()
    }
}

impl SlidingWeekCache {
    const MISS_CHANNEL_CAPACITY: usize = 64;

    /// Create an empty cache for `user`, with UTC week boundaries
    pub fn new(user: impl Into<String>, fetcher: Arc<dyn WeekFetcher>, config: CacheConfig) -> Self {
        let (misses, _) = broadcast::channel(Self::MISS_CHANNEL_CAPACITY);
        Self {
            user: user.into(),
            fetcher,
            config,
            offset: Utc.fix(),
            slots: DashMap::new(),
            counters: Counters::default(),
            misses,
        }
    }

    /// Place week boundaries at local Monday midnight under `offset`
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get cache metrics
    pub fn metrics(&self) -> CacheMetrics {
        self.counters.snapshot()
    }

    /// Receive a [`CacheMissEvent`] for every week that fails to load
    pub fn subscribe_misses(&self) -> broadcast::Receiver<CacheMissEvent> {
        self.misses.subscribe()
    }

    /// True if `week` is fully loaded
    pub fn contains(&self, week: WeekKey) -> bool {
        self.slots
            .get(&week)
            .map(|slot| slot.payload.initialized())
            .unwrap_or(false)
    }

    /// Loaded payload for `week`, without fetching
    pub fn cached(&self, week: WeekKey) -> Option<Arc<WeekPayload>> {
        self.slots
            .get(&week)
            .and_then(|slot| slot.payload.get().cloned())
    }

    /// Loaded weeks, ascending
    pub fn cached_weeks(&self) -> Vec<WeekKey> {
        let mut weeks: Vec<WeekKey> = self
            .slots
            .iter()
            .filter(|entry| entry.value().payload.initialized())
            .map(|entry| *entry.key())
            .collect();
        weeks.sort();
        weeks
    }

    fn slot(&self, week: WeekKey) -> Slot {
        Arc::clone(&*self.slots.entry(week).or_default())
    }

    /// Load every week in `weeks` that is not cached yet.
    ///
    /// Distinct weeks are fetched concurrently. A failing week is reported in
    /// [`EnsureReport::failed`] and does not affect the others.
    pub async fn ensure_weeks(&self, weeks: &[WeekKey]) -> EnsureReport {
        let mut report = EnsureReport::default();
        for (week, outcome) in self.load_weeks(weeks).await {
            match outcome {
                Ok(_) => report.ready.push(week),
                Err(err) => report.failed.push((week, err)),
            }
        }
        report
    }

    /// Sorted, deduplicated weeks with their payload or failure
    async fn load_weeks(&self, weeks: &[WeekKey]) -> Vec<(WeekKey, WeekOutcome)> {
        let mut weeks = weeks.to_vec();
        weeks.sort();
        weeks.dedup();

        join_all(
            weeks
                .into_iter()
                .map(|week| async move { (week, self.ensure_week(week).await) }),
        )
        .await
    }

    /// Payload for `week`, fetching it if needed.
    ///
    /// Callers arriving while a fetch is in flight share its outcome, failure
    /// included. A request made after a failed fetch has finished tries again.
    pub async fn ensure_week(&self, week: WeekKey) -> WeekOutcome {
        Counters::bump(&self.counters.lookups, 1);
        let slot = self.slot(week);

        if let Some(payload) = slot.payload.get() {
            Counters::bump(&self.counters.hits, 1);
            debug!(%week, "Cache hit");
            return Ok(Arc::clone(payload));
        }

        Counters::bump(&self.counters.misses, 1);
        debug!(%week, "Cache miss");

        let failures_seen = slot.failures.load(Ordering::Acquire);
        let mut last_failure = slot.gate.lock().await;

        if let Some(payload) = slot.payload.get() {
            return Ok(Arc::clone(payload));
        }
        if slot.failures.load(Ordering::Acquire) != failures_seen {
            if let Some(err) = last_failure.as_ref() {
                debug!(%week, "Joined a failed fetch");
                return Err(err.clone());
            }
        }

        match self.fetch_with_retry(week).await {
            Ok(payload) => {
                *last_failure = None;
                let cached = slot.payload.get_or_init(|| async move { payload }).await;
                Ok(Arc::clone(cached))
            }
            Err(err) => {
                *last_failure = Some(err.clone());
                slot.failures.fetch_add(1, Ordering::Release);
                // No subscribers is not an error
                let _ = self.misses.send(CacheMissEvent {
                    week,
                    error: err.clone(),
                });
                Err(err)
            }
        }
    }

    async fn fetch_with_retry(&self, week: WeekKey) -> WeekOutcome {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            Counters::bump(&self.counters.fetch_attempts, 1);
            match self.fetch_week(week).await {
                Ok(payload) => {
                    info!(
                        %week,
                        attempt,
                        records = payload.record_count(),
                        "Fetched week"
                    );
                    return Ok(Arc::new(payload));
                }
                Err(err) => {
                    warn!(%week, attempt, attempts, error = %err, "Week fetch failed");
                    last_error = format!("{:#}", err);
                    if attempt < attempts && self.config.retry_backoff_ms > 0 {
                        let backoff = self.config.retry_backoff_ms * u64::from(attempt);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }

        Counters::bump(&self.counters.fetch_failures, 1);
        Err(FetchError::FetchFailed {
            week,
            attempts,
            reason: last_error,
        })
    }

    async fn fetch_week(&self, week: WeekKey) -> anyhow::Result<WeekPayload> {
        let start = week.start_instant(self.offset);
        let end = week.end_instant(self.offset);
        let user = self.user.as_str();
        let fetcher = &self.fetcher;

        let (bpm, step, calorie, sleep, hrv) = tokio::try_join!(
            fetcher.fetch_samples(SampleMetric::HeartRate, user, start, end),
            fetcher.fetch_samples(SampleMetric::Steps, user, start, end),
            fetcher.fetch_samples(SampleMetric::Calories, user, start, end),
            fetcher.fetch_sleep(user, start, end),
            fetcher.fetch_hourly_hrv(user, start, end),
        )?;

        Ok(WeekPayload::new(week, bpm, step, calorie, sleep, hrv))
    }

    async fn collect_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(RangeSlice, Vec<(WeekKey, FetchError)>)> {
        if end < start {
            return Err(SpanError::Inverted { start, end }.into());
        }

        let weeks = WeekKey::spanning(start, end, self.offset);
        let mut slice = RangeSlice::empty(start, end);
        let mut failed = Vec::new();
        let mut previous: Option<WeekKey> = None;

        for (week, outcome) in self.load_weeks(&weeks).await {
            match outcome {
                Ok(payload) => {
                    // intervals crossing in from a loaded predecessor are already in
                    let sleep_floor = previous
                        .filter(|prev| prev.succ() == week)
                        .map(|_| week.start_instant(self.offset));
                    slice.extend_from(&payload, sleep_floor);
                    previous = Some(week);
                }
                Err(err) => {
                    slice.missing_weeks.push(week);
                    failed.push((week, err));
                }
            }
        }
        slice.sort();

        Ok((slice, failed))
    }

    /// Cached data for `[start, end)`, loading overlapping weeks as needed.
    ///
    /// Fails with [`FetchError::CacheMiss`] if any overlapping week cannot be
    /// loaded.
    pub async fn get_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<RangeSlice> {
        let (slice, failed) = self.collect_range(start, end).await?;
        if let Some((week, err)) = failed.into_iter().next() {
            return Err(FetchError::CacheMiss {
                week,
                reason: err.to_string(),
            }
            .into());
        }
        Ok(slice)
    }

    /// Like [`get_range`](Self::get_range), but weeks that fail to load are
    /// listed in [`RangeSlice::missing_weeks`] instead of failing the call.
    pub async fn get_range_partial(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<RangeSlice> {
        let (slice, _) = self.collect_range(start, end).await?;
        Ok(slice)
    }

    /// Warm `selected` and its two neighbors on a background task
    pub fn prefetch_neighbors(self: &Arc<Self>, selected: WeekKey) -> JoinHandle<EnsureReport> {
        let cache = Arc::clone(self);
        let weeks = [selected.pred(), selected, selected.succ()];
        debug!(%selected, "Prefetching neighbor weeks");

        tokio::spawn(async move {
            let report = cache.ensure_weeks(&weeks).await;
            if !report.is_complete() {
                warn!(
                    %selected,
                    failed = report.failed.len(),
                    "Neighbor prefetch incomplete"
                );
            }
            report
        })
    }

    /// Drop loaded weeks more than `radius` weeks from `center`.
    ///
    /// In-flight fetches are left alone. Returns the number of weeks evicted.
    pub fn evict_outside(&self, center: WeekKey, radius: u32) -> usize {
        let before = self.slots.len();
        self.slots.retain(|week, slot| {
            !slot.payload.initialized() || week.distance(&center) <= i64::from(radius)
        });
        let evicted = before.saturating_sub(self.slots.len());

        if evicted > 0 {
            Counters::bump(&self.counters.evictions, evicted as u64);
            info!(%center, radius, evicted, "Evicted distant weeks");
        }
        evicted
    }

    /// Apply the configured eviction policy around `center`
    pub fn apply_retention(&self, center: WeekKey) -> usize {
        match self.config.max_week_distance {
            Some(radius) => self.evict_outside(center, radius),
            None => 0,
        }
    }
}

impl PrefetchSink for SlidingWeekCache {
    fn request_prefetch(self: Arc<Self>, week: WeekKey) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(%week, "No async runtime available, skipping prefetch");
            return;
        }
        // Fire and forget: results land in the cache
        let _ = self.prefetch_neighbors(week);
    }
}
