//! Inbound data-fetch interface
//!
//! The document store behind the dashboard is an external collaborator. The
//! cache only needs the three range queries below; transport errors stay
//! opaque (`anyhow`) and are classified by the cache's retry loop.

use crate::models::{HrvRecord, Sample, SampleMetric, SleepInterval};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Range queries against the raw document store. Ranges are `[start, end)`.
#[async_trait]
pub trait WeekFetcher: Send + Sync {
    /// Raw point samples for one metric
    async fn fetch_samples(
        &self,
        metric: SampleMetric,
        user: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>>;

    /// Sleep stage intervals overlapping the range, including those that
    /// started before it
    async fn fetch_sleep(
        &self,
        user: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SleepInterval>>;

    /// Precomputed hourly HRV
    async fn fetch_hourly_hrv(
        &self,
        user: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HrvRecord>>;
}

/// Fetcher backed by in-memory vectors, for one user.
///
/// Counts every query so callers can observe cache effectiveness.
#[derive(Debug, Default)]
pub struct InMemoryFetcher {
    bpm: Vec<Sample>,
    step: Vec<Sample>,
    calorie: Vec<Sample>,
    sleep: Vec<SleepInterval>,
    hrv: Vec<HrvRecord>,
    queries: AtomicU64,
}

impl InMemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_samples(mut self, metric: SampleMetric, samples: Vec<Sample>) -> Self {
        match metric {
            SampleMetric::HeartRate => self.bpm = samples,
            SampleMetric::Steps => self.step = samples,
            SampleMetric::Calories => self.calorie = samples,
        }
        self
    }

    pub fn with_sleep(mut self, sleep: Vec<SleepInterval>) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_hrv(mut self, hrv: Vec<HrvRecord>) -> Self {
        self.hrv = hrv;
        self
    }

    /// Total range queries served
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }
}

fn in_range(timestamp: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    timestamp >= start && timestamp < end
}

#[async_trait]
impl WeekFetcher for InMemoryFetcher {
    async fn fetch_samples(
        &self,
        metric: SampleMetric,
        _user: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>> {
        self.record_query();
        let source = match metric {
            SampleMetric::HeartRate => &self.bpm,
            SampleMetric::Steps => &self.step,
            SampleMetric::Calories => &self.calorie,
        };
        Ok(source
            .iter()
            .filter(|s| in_range(s.timestamp, start, end))
            .copied()
            .collect())
    }

    async fn fetch_sleep(
        &self,
        _user: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SleepInterval>> {
        self.record_query();
        Ok(self
            .sleep
            .iter()
            .filter(|i| i.overlaps(start, end))
            .copied()
            .collect())
    }

    async fn fetch_hourly_hrv(
        &self,
        _user: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HrvRecord>> {
        self.record_query();
        Ok(self
            .hrv
            .iter()
            .filter(|r| in_range(r.window_start, start, end))
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SleepStage;
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn test_in_memory_fetcher_filters_half_open_range() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let samples = vec![
            Sample::new(t0, 60.0),
            Sample::new(t0 + Duration::hours(1), 62.0),
            Sample::new(t0 + Duration::hours(2), 64.0),
        ];
        let fetcher = InMemoryFetcher::new().with_samples(SampleMetric::HeartRate, samples);

        let result = fetcher
            .fetch_samples(SampleMetric::HeartRate, "user", t0, t0 + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(result.len(), 2);

        let steps = fetcher
            .fetch_samples(SampleMetric::Steps, "user", t0, t0 + Duration::days(1))
            .await
            .unwrap();
        assert!(steps.is_empty());
        assert_eq!(fetcher.query_count(), 2);
    }

    #[tokio::test]
    async fn test_sleep_query_includes_intervals_started_earlier() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let fetcher = InMemoryFetcher::new().with_sleep(vec![
            SleepInterval::new(t0 - Duration::hours(1), t0 + Duration::hours(7), SleepStage::Deep),
            SleepInterval::new(t0 - Duration::hours(5), t0 - Duration::hours(2), SleepStage::Rem),
        ]);

        let result = fetcher
            .fetch_sleep("user", t0, t0 + Duration::days(7))
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].stage, SleepStage::Deep);
    }
}
