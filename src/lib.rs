// Library interface for VitalDash modules
// The CLI and integration tests both build on these

pub mod aggregation;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod fetch;
pub mod hrv;
pub mod logging;
pub mod models;
pub mod navigator;
pub mod sleep;

// Re-export commonly used types for convenience
pub use models::*;
pub use aggregation::{merge_with_predictions, TimeBucketAggregator};
pub use cache::{CacheConfig, CacheMetrics, CacheMissEvent, EnsureReport, RangeSlice, SlidingWeekCache};
pub use config::AppConfig;
pub use dashboard::{DashboardSession, DisplayWindow};
pub use error::{FetchError, Result, SpanError, StatisticsError, VitalDashError, WindowError};
pub use fetch::{InMemoryFetcher, WeekFetcher};
pub use hrv::{HrvWindowAnalyzer, NnIntervalStatistics, StressScoreConfig};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use navigator::{NavigationOutcome, PrefetchSink, WindowNavigator};
pub use sleep::SleepStageResampler;
