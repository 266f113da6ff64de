//! Structured logging for VitalDash
//!
//! Stdout output in pretty, JSON or compact form, plus an optional JSON file
//! sink with daily rotation.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: LogLevel,

    /// Output format (pretty, json, compact)
    pub format: LogFormat,

    /// Log file path (None for stdout only)
    pub file_path: Option<PathBuf>,

    /// Rotate the log file daily
    pub rotation: bool,

    /// Include span information
    pub include_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: true,
            include_spans: false,
        }
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    pub fn to_filter(&self) -> String {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
        .to_string()
    }

    /// Raise `self` by the number of `-v` flags given on the command line
    pub fn raised_by(self, verbosity: u8) -> LogLevel {
        let levels = [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ];
        let current = levels.iter().position(|l| *l == self).unwrap_or(2);
        let raised = (current + verbosity as usize).min(levels.len() - 1);
        levels[raised]
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format with colors
    Pretty,
    /// JSON format for log shipping
    Json,
    /// Compact format
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

/// Default filter directive when `RUST_LOG` is unset
pub fn default_filter(level: LogLevel) -> String {
    format!("vitaldash={}", level.to_filter())
}

/// Initialize the global subscriber
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config.level)));

    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let stdout_layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(config.include_spans)
            .with_span_list(config.include_spans)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer);

    match &config.file_path {
        Some(file_path) => {
            let directory = file_path.parent().unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(directory)?;

            let file_name = file_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("vitaldash.log");

            let file_layer = if config.rotation {
                fmt::layer()
                    .json()
                    .with_writer(tracing_appender::rolling::daily(directory, file_name))
                    .with_target(true)
                    .with_current_span(config.include_spans)
                    .with_span_list(config.include_spans)
                    .boxed()
            } else {
                fmt::layer()
                    .json()
                    .with_writer(tracing_appender::rolling::never(directory, file_name))
                    .with_target(true)
                    .with_current_span(config.include_spans)
                    .with_span_list(config.include_spans)
                    .boxed()
            };

            subscriber.with(file_layer).try_init()?;
        }
        None => subscriber.try_init()?,
    }

    tracing::info!(
        level = ?config.level,
        format = ?config.format,
        file = ?config.file_path,
        "Logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
    }

    #[test]
    fn test_verbosity_raises_level() {
        assert_eq!(LogLevel::Info.raised_by(0), LogLevel::Info);
        assert_eq!(LogLevel::Info.raised_by(1), LogLevel::Debug);
        assert_eq!(LogLevel::Warn.raised_by(9), LogLevel::Trace);
    }

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(LogLevel::Debug), "vitaldash=debug");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: LogConfig = toml::from_str("level = \"warn\"").unwrap();
        assert_eq!(config.level, LogLevel::Warn);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file_path.is_none());
    }
}
