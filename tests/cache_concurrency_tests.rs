use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use vitaldash::cache::{CacheConfig, SlidingWeekCache};
use vitaldash::error::FetchError;
use vitaldash::fetch::WeekFetcher;
use vitaldash::models::{HrvRecord, Sample, SampleMetric, SleepInterval, WeekKey};

/// Fetcher whose heart-rate query for selected weeks waits on a gate
#[derive(Default)]
struct GatedFetcher {
    gates: Mutex<HashMap<DateTime<Utc>, Arc<Notify>>>,
    failing: Mutex<Vec<DateTime<Utc>>>,
    calls: Mutex<HashMap<DateTime<Utc>, u64>>,
    total: AtomicU64,
    delay_ms: u64,
}

impl GatedFetcher {
    fn gate(&self, week: WeekKey) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(week.start_instant(utc()), notify.clone());
        notify
    }

    fn fail(&self, week: WeekKey) {
        self.failing.lock().unwrap().push(week.start_instant(utc()));
    }

    fn calls_for(&self, week: WeekKey) -> u64 {
        self.calls
            .lock()
            .unwrap()
            .get(&week.start_instant(utc()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl WeekFetcher for GatedFetcher {
    async fn fetch_samples(
        &self,
        metric: SampleMetric,
        _user: &str,
        start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Sample>> {
        if metric != SampleMetric::HeartRate {
            return Ok(Vec::new());
        }
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().unwrap().entry(start).or_insert(0) += 1;

        let gate = self.gates.lock().unwrap().get(&start).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.failing.lock().unwrap().contains(&start) {
            anyhow::bail!("timeout talking to store");
        }
        Ok(vec![Sample::new(start + Duration::hours(12), 65.0)])
    }

    async fn fetch_sleep(
        &self,
        _user: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<SleepInterval>> {
        Ok(Vec::new())
    }

    async fn fetch_hourly_hrv(
        &self,
        _user: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<HrvRecord>> {
        Ok(Vec::new())
    }
}

fn utc() -> chrono::FixedOffset {
    chrono::FixedOffset::east_opt(0).unwrap()
}

fn week(y: i32, m: u32, d: u32) -> WeekKey {
    WeekKey::containing(NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

fn config() -> CacheConfig {
    CacheConfig {
        retry_attempts: 2,
        retry_backoff_ms: 0,
        max_week_distance: None,
    }
}

#[tokio::test]
async fn test_slow_week_does_not_block_other_weeks() {
    let fetcher = Arc::new(GatedFetcher::default());
    let slow = week(2024, 1, 3);
    let fast = week(2024, 1, 10);
    let gate = fetcher.gate(slow);
    let cache = Arc::new(SlidingWeekCache::new("user", fetcher.clone(), config()));

    let pending = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.ensure_weeks(&[slow]).await })
    };
    tokio::task::yield_now().await;

    // The slow week is still in flight; a different week loads regardless
    let report = cache.ensure_weeks(&[fast]).await;
    assert_eq!(report.ready, vec![fast]);
    assert!(cache.contains(fast));
    assert!(!cache.contains(slow));

    gate.notify_one();
    let report = pending.await.unwrap();
    assert_eq!(report.ready, vec![slow]);
}

#[tokio::test]
async fn test_many_concurrent_callers_share_one_fetch() {
    let fetcher = Arc::new(GatedFetcher::default());
    let target = week(2024, 2, 14);
    let gate = fetcher.gate(target);
    let cache = Arc::new(SlidingWeekCache::new("user", fetcher.clone(), config()));
    let start = target.start_instant(utc());
    let end = target.end_instant(utc());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_range(start, end).await })
        })
        .collect();

    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    gate.notify_one();

    for handle in handles {
        let slice = handle.await.unwrap().unwrap();
        assert_eq!(slice.bpm.len(), 1);
    }
    assert_eq!(fetcher.calls_for(target), 1);
    assert_eq!(cache.metrics().fetch_attempts, 1);
}

#[tokio::test]
async fn test_failure_is_reported_per_week_and_retried_later() {
    let fetcher = Arc::new(GatedFetcher::default());
    let bad = week(2024, 3, 4);
    let good = week(2024, 3, 11);
    fetcher.fail(bad);
    let cache = SlidingWeekCache::new("user", fetcher.clone(), config());
    let mut misses = cache.subscribe_misses();

    let report = cache.ensure_weeks(&[good, bad, good]).await;
    assert_eq!(report.ready, vec![good]);
    assert_eq!(report.failed.len(), 1);
    match &report.failed[0].1 {
        FetchError::FetchFailed { week, attempts, reason } => {
            assert_eq!(*week, bad);
            assert_eq!(*attempts, 2);
            assert!(reason.contains("timeout"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(misses.recv().await.unwrap().week, bad);
    assert_eq!(fetcher.calls_for(bad), 2);

    // A failed week is not cached, so a later request tries again
    fetcher.failing.lock().unwrap().clear();
    let report = cache.ensure_weeks(&[bad]).await;
    assert!(report.is_complete());
    assert_eq!(fetcher.calls_for(bad), 3);
    assert_eq!(fetcher.calls_for(good), 1);
    assert_eq!(fetcher.total.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_callers_waiting_on_failing_week_share_the_failure() {
    let fetcher = Arc::new(GatedFetcher {
        delay_ms: 20,
        ..Default::default()
    });
    let bad = week(2024, 4, 3);
    fetcher.fail(bad);
    let cache = SlidingWeekCache::new("user", fetcher.clone(), config());
    let mut misses = cache.subscribe_misses();

    let outcomes = join_all((0..4).map(|_| cache.ensure_week(bad))).await;
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, Err(FetchError::FetchFailed { attempts: 2, .. }))));

    // one retry cycle for all four callers
    assert_eq!(fetcher.calls_for(bad), 2);
    assert_eq!(cache.metrics().fetch_attempts, 2);
    assert_eq!(cache.metrics().fetch_failures, 1);
    assert_eq!(misses.try_recv().unwrap().week, bad);
    assert!(misses.try_recv().is_err());

    // A request made after the failure settled starts a new fetch
    cache.ensure_week(bad).await.unwrap_err();
    assert_eq!(fetcher.calls_for(bad), 4);
}

#[tokio::test]
async fn test_range_keeps_week_evicted_while_loading() {
    let fetcher = Arc::new(GatedFetcher::default());
    let early = week(2024, 5, 6);
    let late = early.succ();
    let gate = fetcher.gate(late);
    let cache = Arc::new(SlidingWeekCache::new("user", fetcher.clone(), config()));
    let start = early.start_instant(utc());
    let end = late.end_instant(utc());

    let pending = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_range(start, end).await })
    };
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    // early is loaded, late is still in flight and survives eviction
    assert!(cache.contains(early));
    assert_eq!(cache.evict_outside(late.offset_by(10), 0), 1);
    assert!(!cache.contains(early));

    gate.notify_one();
    let slice = pending.await.unwrap().unwrap();
    assert_eq!(slice.bpm.len(), 2);
    assert!(slice.missing_weeks.is_empty());
}
