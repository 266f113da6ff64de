//! Per-user dashboard session
//!
//! Owns the week cache and the window navigator for one user and exposes the
//! data the rendering layer draws: bucketed metrics, the per-minute sleep
//! timeline and hourly HRV for the current window. Created when a user opens
//! the dashboard, dropped when they leave.

use crate::aggregation::TimeBucketAggregator;
use crate::cache::{CacheMetrics, CacheMissEvent, RangeSlice, SlidingWeekCache};
use crate::config::{AppConfig, DisplaySettings};
use crate::error::{Result, WindowError};
use crate::fetch::WeekFetcher;
use crate::models::{
    local_date, Bucket, DateWindow, Direction, HrvRecord, RangeSize, Resolution, SampleMetric,
    SleepMinute, WeekKey,
};
use crate::navigator::{NavigationOutcome, PrefetchSink, WindowNavigator};
use crate::sleep::SleepStageResampler;
use chrono::{FixedOffset, NaiveDate};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Everything the rendering layer needs for the current window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayWindow {
    pub window: DateWindow,
    pub range_size: RangeSize,
    pub resolution: Resolution,
    pub bpm_buckets: Vec<Bucket>,
    pub step_buckets: Vec<Bucket>,
    pub calorie_buckets: Vec<Bucket>,
    pub sleep_minutes: Vec<SleepMinute>,
    pub hrv: Vec<HrvRecord>,

    /// Weeks that failed to load; their span renders as a gap
    pub missing_weeks: Vec<WeekKey>,
}

pub struct DashboardSession {
    id: Uuid,
    offset: FixedOffset,
    display: DisplaySettings,
    cache: Arc<SlidingWeekCache>,
    navigator: WindowNavigator,
}

impl DashboardSession {
    /// Open a session for `user` backed by `fetcher`
    pub fn new(user: impl Into<String>, fetcher: Arc<dyn WeekFetcher>, config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let offset = config.display.utc_offset()?;
        let id = Uuid::new_v4();

        let cache = Arc::new(
            SlidingWeekCache::new(user, fetcher, config.cache.clone()).with_offset(offset),
        );
        let sink: Arc<dyn PrefetchSink> = cache.clone();
        let navigator = WindowNavigator::new(config.display.default_range)
            .with_offset(offset)
            .with_prefetch(sink);

        info!(session = %id, user = cache.user(), "Dashboard session opened");

        Ok(Self {
            id,
            offset,
            display: config.display.clone(),
            cache,
            navigator,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn window(&self) -> Option<DateWindow> {
        self.navigator.window()
    }

    pub fn range_size(&self) -> RangeSize {
        self.navigator.range_size()
    }

    pub fn cache(&self) -> &Arc<SlidingWeekCache> {
        &self.cache
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    /// Cache-miss notifications for this session
    pub fn subscribe_cache_misses(&self) -> broadcast::Receiver<CacheMissEvent> {
        self.cache.subscribe_misses()
    }

    /// Data coverage bounds arrived
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn on_coverage(&mut self, db_start: NaiveDate, db_end: NaiveDate) -> Result<DateWindow> {
        let window = self.navigator.set_coverage(db_start, db_end)?;
        self.retain_around(window);
        Ok(window)
    }

    #[instrument(skip(self), fields(session = %self.id))]
    pub fn on_select_date(&mut self, date: NaiveDate) -> Result<DateWindow> {
        let window = self.navigator.select_date(date)?;
        self.retain_around(window);
        Ok(window)
    }

    #[instrument(skip(self), fields(session = %self.id))]
    pub fn on_navigate(&mut self, direction: Direction) -> Result<NavigationOutcome> {
        let outcome = self.navigator.navigate(direction)?;
        if let NavigationOutcome::Moved(window) = outcome {
            self.retain_around(window);
        }
        Ok(outcome)
    }

    #[instrument(skip(self), fields(session = %self.id))]
    pub fn on_range_size_change(&mut self, size: RangeSize) -> Result<DateWindow> {
        let window = self.navigator.change_range_size(size)?;
        self.retain_around(window);
        Ok(window)
    }

    /// Build the display data for the current window.
    ///
    /// Weeks that fail to load are listed in `missing_weeks`; series that
    /// cannot be computed come back empty.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn get_display_window(&self) -> Result<DisplayWindow> {
        let window = self.navigator.window().ok_or(WindowError::NotReady)?;
        let range_size = self.navigator.range_size();
        let resolution = self.display.resolution_for(range_size);

        let slice = self.cache.get_range_partial(window.start, window.end).await?;
        if !slice.missing_weeks.is_empty() {
            warn!(missing = ?slice.missing_weeks, "Display window has unloaded weeks");
        }

        let sleep_minutes = SleepStageResampler::new()
            .resample(&slice.sleep, window.start, window.end)
            .unwrap_or_else(|err| {
                warn!(error = %err, "Sleep timeline unavailable");
                Vec::new()
            });

        Ok(DisplayWindow {
            window,
            range_size,
            resolution,
            bpm_buckets: self.buckets(SampleMetric::HeartRate, &slice, resolution),
            step_buckets: self.buckets(SampleMetric::Steps, &slice, resolution),
            calorie_buckets: self.buckets(SampleMetric::Calories, &slice, resolution),
            sleep_minutes,
            hrv: slice.hrv,
            missing_weeks: slice.missing_weeks,
        })
    }

    fn buckets(&self, metric: SampleMetric, slice: &RangeSlice, resolution: Resolution) -> Vec<Bucket> {
        TimeBucketAggregator::for_metric(metric, resolution)
            .with_offset(self.offset)
            .aggregate(slice.samples(metric), slice.start, slice.end)
            .unwrap_or_else(|err| {
                warn!(%metric, error = %err, "Bucketing failed");
                Vec::new()
            })
    }

    fn retain_around(&self, window: DateWindow) {
        let center = WeekKey::containing(local_date(window.start, self.offset));
        self.cache.apply_retention(center);
    }
}

impl Drop for DashboardSession {
    fn drop(&mut self) {
        let metrics = self.cache.metrics();
        info!(
            session = %self.id,
            lookups = metrics.lookups,
            hit_rate = metrics.hit_rate(),
            fetch_failures = metrics.fetch_failures,
            "Dashboard session closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::InMemoryFetcher;
    use crate::models::{local_midnight, Sample, SleepInterval, SleepStage};
    use chrono::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn fetcher() -> Arc<InMemoryFetcher> {
        let day = local_midnight(date(2024, 1, 10), utc());
        let bpm = (0..24)
            .map(|h| Sample::new(day + Duration::hours(h) + Duration::minutes(5), 60.0 + h as f64))
            .collect();
        let sleep = vec![SleepInterval::new(
            day + Duration::hours(1),
            day + Duration::hours(2),
            SleepStage::Deep,
        )];
        Arc::new(
            InMemoryFetcher::new()
                .with_samples(SampleMetric::HeartRate, bpm)
                .with_sleep(sleep),
        )
    }

    #[tokio::test]
    async fn test_display_window_not_ready() {
        let session = DashboardSession::new("user", fetcher(), &AppConfig::default()).unwrap();
        assert!(matches!(
            session.get_display_window().await,
            Err(crate::error::VitalDashError::Window(WindowError::NotReady))
        ));
    }

    #[tokio::test]
    async fn test_day_window_buckets_by_minute() {
        let mut session = DashboardSession::new("user", fetcher(), &AppConfig::default()).unwrap();
        session.on_coverage(date(2024, 1, 1), date(2024, 1, 31)).unwrap();
        session.on_range_size_change(RangeSize::Day).unwrap();
        session.on_select_date(date(2024, 1, 10)).unwrap();

        let display = session.get_display_window().await.unwrap();
        assert_eq!(display.resolution, Resolution::Minute);
        assert_eq!(display.bpm_buckets.len(), 24 * 60);
        assert_eq!(display.bpm_buckets.iter().filter(|b| b.value.is_some()).count(), 24);
        assert_eq!(display.sleep_minutes.len(), 24 * 60);
        assert_eq!(
            display
                .sleep_minutes
                .iter()
                .filter(|m| m.stage == SleepStage::Deep)
                .count(),
            60
        );
        assert!(display.missing_weeks.is_empty());
    }

    #[tokio::test]
    async fn test_week_window_buckets_by_hour() {
        let mut session = DashboardSession::new("user", fetcher(), &AppConfig::default()).unwrap();
        session.on_coverage(date(2024, 1, 1), date(2024, 1, 31)).unwrap();
        session.on_select_date(date(2024, 1, 10)).unwrap();

        let display = session.get_display_window().await.unwrap();
        assert_eq!(display.range_size, RangeSize::Week);
        assert_eq!(display.bpm_buckets.len(), 7 * 24);
        assert_eq!(display.window.start, local_midnight(date(2024, 1, 8), utc()));
    }
}
