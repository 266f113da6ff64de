//! Unified error hierarchy for VitalDash
//!
//! Statistical and span errors are local to one computation and are resolved
//! into absent data by the session layer. Fetch errors are scoped to a single
//! week key and are always reported, never dropped.

use crate::models::WeekKey;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

/// Top-level error type for all VitalDash operations
#[derive(Debug, Error)]
pub enum VitalDashError {
    /// HRV statistics errors
    #[error("Statistics error: {0}")]
    Statistics(#[from] StatisticsError),

    /// Malformed time spans
    #[error("Span error: {0}")]
    Span(#[from] SpanError),

    /// Week fetch / cache errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Window navigation errors
    #[error("Window error: {0}")]
    Window(#[from] WindowError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while turning NN intervals into HRV features
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatisticsError {
    /// Fewer than two intervals, the difference series would be empty
    #[error("Insufficient data: need at least {required} NN intervals, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    /// Mean NN interval is zero, ratio features are undefined
    #[error("Mean NN interval is zero")]
    ZeroMeanInterval,
}

/// Malformed span passed to a bucketing or resampling call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpanError {
    /// End lies before start
    #[error("Invalid span: end {end} is before start {start}")]
    Inverted {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// Start does not fall on a bucket boundary
    #[error("Invalid span: start {start} is not aligned to {resolution} buckets")]
    Misaligned {
        start: DateTime<Utc>,
        resolution: String,
    },

    /// Timestamp arithmetic left the representable range
    #[error("Timestamp out of range: {seconds}s")]
    OutOfRange { seconds: i64 },
}

/// Errors scoped to a single week key
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// Every retry attempt failed
    #[error("Fetch failed for week {week} after {attempts} attempts: {reason}")]
    FetchFailed {
        week: WeekKey,
        attempts: u32,
        reason: String,
    },

    /// A range request needed a week that could not be loaded
    #[error("Cache miss for week {week}: {reason}")]
    CacheMiss { week: WeekKey, reason: String },
}

impl FetchError {
    /// Week the error is recorded against
    pub fn week(&self) -> WeekKey {
        match self {
            FetchError::FetchFailed { week, .. } | FetchError::CacheMiss { week, .. } => *week,
        }
    }
}

/// Window navigator errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WindowError {
    /// Data coverage bounds have not arrived yet
    #[error("Window not ready: data coverage bounds are unknown")]
    NotReady,

    /// Coverage end precedes coverage start
    #[error("Invalid data coverage: {end} is before {start}")]
    InvalidCoverage { start: NaiveDate, end: NaiveDate },
}

/// Result type alias for VitalDash operations
pub type Result<T> = std::result::Result<T, VitalDashError>;

impl VitalDashError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VitalDashError::Fetch(_)
                | VitalDashError::Window(WindowError::NotReady)
                | VitalDashError::Io(_)
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            VitalDashError::Statistics(_) => ErrorSeverity::Info,
            VitalDashError::Window(_) => ErrorSeverity::Warning,
            VitalDashError::Fetch(_) => ErrorSeverity::Warning,
            VitalDashError::Span(_) => ErrorSeverity::Error,
            VitalDashError::Configuration(_) => ErrorSeverity::Error,
            VitalDashError::Io(_) => ErrorSeverity::Error,
            VitalDashError::Internal(_) => ErrorSeverity::Critical,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            VitalDashError::Statistics(StatisticsError::InsufficientData { .. }) => {
                "No HRV available for this period.".to_string()
            }
            VitalDashError::Fetch(err) => {
                format!(
                    "Could not load data for the week of {}. That range is shown as a gap.",
                    err.week()
                )
            }
            VitalDashError::Window(WindowError::NotReady) => {
                "Data range is still loading, please try again shortly.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}
