use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::cache::CacheConfig;
use crate::error::VitalDashError;
use crate::hrv::{NnFilter, StressScoreConfig};
use crate::logging::LogConfig;
use crate::models::{RangeSize, Resolution};

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Configuration metadata
    pub metadata: ConfigMetadata,

    /// Log output settings
    pub logging: LogConfig,

    /// Week cache retry and retention settings
    pub cache: CacheConfig,

    /// HRV analysis parameters
    pub analysis: AnalysisSettings,

    /// Display window and bucketing preferences
    pub display: DisplaySettings,
}

/// Configuration metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

impl Default for ConfigMetadata {
    fn default() -> Self {
        let now = Utc::now();
        ConfigMetadata {
            version: "1.0".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// HRV analysis settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// SDNN (ms) mapped to a stress score of 0
    pub stress_sdnn_floor: f64,

    /// SDNN (ms) mapped to a stress score of 10
    pub stress_sdnn_ceiling: f64,

    /// Shortest plausible NN interval (ms)
    pub nn_low_ms: f64,

    /// Longest plausible NN interval (ms)
    pub nn_high_ms: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        AnalysisSettings {
            stress_sdnn_floor: 0.0,
            stress_sdnn_ceiling: 100.0,
            nn_low_ms: 300.0,
            nn_high_ms: 2_000.0,
        }
    }
}

impl AnalysisSettings {
    pub fn stress_config(&self) -> StressScoreConfig {
        StressScoreConfig {
            sdnn_floor: self.stress_sdnn_floor,
            sdnn_ceiling: self.stress_sdnn_ceiling,
        }
    }

    pub fn nn_filter(&self) -> NnFilter {
        NnFilter {
            low_ms: self.nn_low_ms,
            high_ms: self.nn_high_ms,
        }
    }
}

/// Display preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    /// Offset used for calendar days and week boundaries, in minutes east of UTC
    pub utc_offset_minutes: i32,

    /// Bucket width for a one-day window
    pub day_resolution: Resolution,

    /// Bucket width for a one-week window
    pub week_resolution: Resolution,

    /// Range size a new session opens with
    pub default_range: RangeSize,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        DisplaySettings {
            utc_offset_minutes: 0,
            day_resolution: Resolution::Minute,
            week_resolution: Resolution::Hour,
            default_range: RangeSize::Week,
        }
    }
}

impl DisplaySettings {
    const MAX_OFFSET_MINUTES: i32 = 14 * 60;

    /// Injected display offset
    pub fn utc_offset(&self) -> crate::error::Result<FixedOffset> {
        if self.utc_offset_minutes.abs() > Self::MAX_OFFSET_MINUTES {
            return Err(VitalDashError::Configuration(format!(
                "utc_offset_minutes must be within ±{}, got {}",
                Self::MAX_OFFSET_MINUTES,
                self.utc_offset_minutes
            )));
        }
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            VitalDashError::Configuration(format!(
                "Invalid UTC offset: {} minutes",
                self.utc_offset_minutes
            ))
        })
    }

    /// Bucket width used for a window of `size`
    pub fn resolution_for(&self, size: RangeSize) -> Resolution {
        match size {
            RangeSize::Day => self.day_resolution,
            RangeSize::Week => self.week_resolution,
        }
    }
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;

        config.validate()?;
        debug!(path = %path.as_ref().display(), "Configuration loaded");
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let toml_content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vitaldash")
            .join("config.toml")
    }

    pub fn load_or_default() -> Self {
        let config_path = Self::default_config_path();

        match Self::load_from_file(&config_path) {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    path = %config_path.display(),
                    error = %err,
                    "Config not loaded, using defaults"
                );
                Self::default()
            }
        }
    }

    pub fn save_default(&mut self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to_file(config_path)
    }

    /// Reject settings the analytics core cannot run with
    pub fn validate(&self) -> crate::error::Result<()> {
        self.analysis.stress_config().validate()?;

        if !(self.analysis.nn_low_ms > 0.0 && self.analysis.nn_low_ms < self.analysis.nn_high_ms) {
            return Err(VitalDashError::Configuration(format!(
                "NN interval bounds must satisfy 0 < low < high, got {}..{}",
                self.analysis.nn_low_ms, self.analysis.nn_high_ms
            )));
        }

        if self.cache.retry_attempts == 0 {
            return Err(VitalDashError::Configuration(
                "cache.retry_attempts must be at least 1".to_string(),
            ));
        }

        self.display.utc_offset()?;
        Ok(())
    }
}
