//! Heart Rate Variability statistics
//!
//! Converts a series of NN (normal-to-normal) intervals into the standard
//! time-domain HRV feature vector.
//!
//! # Metrics
//!
//! - **SDNN**: sample standard deviation of the NN intervals (divisor `n - 1`).
//! - **SDSD**: standard deviation of successive differences. Computed as a
//!   *population* standard deviation (divisor = number of differences), unlike
//!   SDNN. The two divisors differ on purpose and must match the stored
//!   hourly HRV series.
//! - **RMSSD**: root mean square of successive differences.
//! - **pNN50 / pNN20**: share of successive differences above 50 / 20 ms,
//!   expressed against the number of NN intervals.
//! - **Stress score**: SDNN mapped linearly onto `[0, 10]` between two policy
//!   bounds (see [`StressScoreConfig`]). This is a display scale, not a
//!   clinical index.
//!
//! All values are `f64` milliseconds (or bpm for the heart-rate block) and are
//! never rounded here.
//!
//! The dashboard normally consumes precomputed hourly HRV. These routines are
//! used when raw beats or NN intervals are supplied directly, e.g. by the
//! `vitaldash hrv` batch command.

use crate::aggregation::floor_to_resolution;
use crate::error::{Result, StatisticsError, VitalDashError};
use crate::models::{HrvFeatures, HrvRecord, Resolution};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median, Statistics};
use std::collections::BTreeMap;
use tracing::debug;

/// Minimum number of NN intervals for a non-empty difference series
pub const MIN_NN_INTERVALS: usize = 2;

/// Linear SDNN → stress score mapping bounds (ms)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StressScoreConfig {
    /// SDNN mapped to a score of 0
    pub sdnn_floor: f64,

    /// SDNN mapped to a score of 10
    pub sdnn_ceiling: f64,
}

impl Default for StressScoreConfig {
    fn default() -> Self {
        Self {
            sdnn_floor: 0.0,
            sdnn_ceiling: 100.0,
        }
    }
}

impl StressScoreConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.sdnn_ceiling > self.sdnn_floor) {
            return Err(VitalDashError::Configuration(format!(
                "stress score ceiling ({}) must be greater than floor ({})",
                self.sdnn_ceiling, self.sdnn_floor
            )));
        }
        Ok(())
    }

    /// Score in `[0, 10]` for a given SDNN
    pub fn score(&self, sdnn: f64) -> f64 {
        let scaled = 10.0 * (sdnn - self.sdnn_floor) / (self.sdnn_ceiling - self.sdnn_floor);
        scaled.clamp(0.0, 10.0)
    }
}

/// NN interval → HRV feature vector engine
#[derive(Debug, Clone, Default)]
pub struct NnIntervalStatistics {
    stress: StressScoreConfig,
}

impl NnIntervalStatistics {
    /// Create engine with the default 0–100 ms stress mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Create engine with custom stress bounds
    pub fn with_stress_config(stress: StressScoreConfig) -> Result<Self> {
        stress.validate()?;
        Ok(Self { stress })
    }

    pub fn stress_config(&self) -> &StressScoreConfig {
        &self.stress
    }

    /// Compute the full feature vector for `nni` (milliseconds)
    pub fn compute(&self, nni: &[f64]) -> std::result::Result<HrvFeatures, StatisticsError> {
        let n = nni.len();
        if n < MIN_NN_INTERVALS {
            return Err(StatisticsError::InsufficientData {
                required: MIN_NN_INTERVALS,
                actual: n,
            });
        }

        let diff_nni: Vec<f64> = nni.windows(2).map(|w| w[1] - w[0]).collect();

        let mean_nni = nni.iter().mean();
        if mean_nni == 0.0 {
            return Err(StatisticsError::ZeroMeanInterval);
        }
        let median_nni = Data::new(nni.to_vec()).median();
        let (min_nni, max_nni) = min_max(nni);
        let range_nni = max_nni - min_nni;

        let sdsd = diff_nni.iter().population_std_dev();
        let rmssd = diff_nni.iter().map(|d| d * d).mean().sqrt();

        let nni_50 = count_above(&diff_nni, 50.0);
        let nni_20 = count_above(&diff_nni, 20.0);
        let pnni_50 = 100.0 * nni_50 as f64 / n as f64;
        let pnni_20 = 100.0 * nni_20 as f64 / n as f64;

        let cvsd = rmssd / mean_nni;
        let sdnn = nni.iter().std_dev();
        let cvnni = sdnn / mean_nni;

        let heart_rate: Vec<f64> = nni.iter().map(|v| 60_000.0 / v).collect();
        let mean_hr = heart_rate.iter().mean();
        let (min_hr, max_hr) = min_max(&heart_rate);
        let std_hr = heart_rate.iter().population_std_dev();

        Ok(HrvFeatures {
            mean_nni,
            median_nni,
            range_nni,
            sdnn,
            sdsd,
            rmssd,
            nni_50,
            pnni_50,
            nni_20,
            pnni_20,
            cvsd,
            cvnni,
            mean_hr,
            min_hr,
            max_hr,
            std_hr,
            stress_score: self.stress.score(sdnn),
        })
    }

    /// Like [`compute`](Self::compute) but resolves statistical errors into
    /// "no HRV available".
    pub fn try_compute(&self, nni: &[f64]) -> Option<HrvFeatures> {
        match self.compute(nni) {
            Ok(features) => Some(features),
            Err(err) => {
                debug!(intervals = nni.len(), error = %err, "No HRV available");
                None
            }
        }
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

fn count_above(diffs: &[f64], threshold: f64) -> u32 {
    diffs.iter().filter(|d| d.abs() > threshold).count() as u32
}

/// Milliseconds between consecutive beat timestamps
pub fn nn_intervals_from_beats(beats: &[DateTime<Utc>]) -> Vec<f64> {
    let mut sorted = beats.to_vec();
    sorted.sort();
    sorted
        .windows(2)
        .map(|w| (w[1] - w[0]).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000.0)
        .collect()
}

/// Drop intervals outside `[low_ms, high_ms]` (missed or extra beats)
pub fn clean_nn_intervals(nni: &[f64], low_ms: f64, high_ms: f64) -> Vec<f64> {
    nni.iter()
        .copied()
        .filter(|v| *v >= low_ms && *v <= high_ms)
        .collect()
}

/// Accepted NN interval range for [`HrvWindowAnalyzer`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NnFilter {
    pub low_ms: f64,
    pub high_ms: f64,
}

impl Default for NnFilter {
    fn default() -> Self {
        Self {
            low_ms: 300.0,
            high_ms: 2_000.0,
        }
    }
}

/// Per-window HRV from raw beat timestamps (offline analysis path)
#[derive(Debug, Clone)]
pub struct HrvWindowAnalyzer {
    statistics: NnIntervalStatistics,
    filter: NnFilter,
    resolution: Resolution,
    offset: FixedOffset,
}

impl HrvWindowAnalyzer {
    pub fn new(statistics: NnIntervalStatistics, resolution: Resolution) -> Self {
        Self {
            statistics,
            filter: NnFilter::default(),
            resolution,
            offset: Utc.fix(),
        }
    }

    pub fn with_filter(mut self, filter: NnFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    /// One record per window holding enough clean intervals, ascending.
    ///
    /// Intervals spanning a window boundary are not attributed to either side.
    pub fn analyze(&self, beats: &[DateTime<Utc>]) -> Result<Vec<HrvRecord>> {
        let mut windows: BTreeMap<DateTime<Utc>, Vec<DateTime<Utc>>> = BTreeMap::new();
        for beat in beats {
            let start = floor_to_resolution(*beat, self.resolution, self.offset)?;
            windows.entry(start).or_default().push(*beat);
        }

        let windows: Vec<(DateTime<Utc>, Vec<DateTime<Utc>>)> = windows.into_iter().collect();
        let mut records: Vec<HrvRecord> = windows
            .into_par_iter()
            .filter_map(|(window_start, beats)| {
                let nni = nn_intervals_from_beats(&beats);
                let clean = clean_nn_intervals(&nni, self.filter.low_ms, self.filter.high_ms);
                self.statistics
                    .try_compute(&clean)
                    .map(|features| HrvRecord {
                        window_start,
                        features,
                    })
            })
            .collect();

        records.sort_by_key(|r| r.window_start);
        debug!(
            beats = beats.len(),
            windows = records.len(),
            resolution = %self.resolution,
            "HRV window analysis complete"
        );
        Ok(records)
    }
}
