use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamped scalar sample (heart rate, steps, calories)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Instant the value was recorded
    pub timestamp: DateTime<Utc>,

    /// Raw value (bpm, step count, kcal)
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Raw point metrics served by the fetch layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleMetric {
    HeartRate,
    Steps,
    Calories,
}

impl SampleMetric {
    /// Reduction applied when several samples share a bucket.
    ///
    /// Rate metrics are averaged, cumulative metrics are summed.
    pub fn reduction(&self) -> Reduction {
        match self {
            SampleMetric::HeartRate => Reduction::Mean,
            SampleMetric::Steps | SampleMetric::Calories => Reduction::Sum,
        }
    }
}

impl fmt::Display for SampleMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleMetric::HeartRate => write!(f, "heart-rate"),
            SampleMetric::Steps => write!(f, "steps"),
            SampleMetric::Calories => write!(f, "calories"),
        }
    }
}

impl FromStr for SampleMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "heart-rate" | "heartrate" | "bpm" | "hr" => Ok(SampleMetric::HeartRate),
            "steps" | "step" => Ok(SampleMetric::Steps),
            "calories" | "calorie" | "kcal" => Ok(SampleMetric::Calories),
            _ => Err(format!("Invalid metric: {}", s)),
        }
    }
}

/// How the samples of one bucket collapse into a single value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    Mean,
    Sum,
}

/// Fixed bucket width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Minute,
    Hour,
    Day,
}

impl Resolution {
    /// Bucket width in seconds
    pub fn seconds(&self) -> i64 {
        match self {
            Resolution::Minute => 60,
            Resolution::Hour => 3_600,
            Resolution::Day => 86_400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Minute => write!(f, "minute"),
            Resolution::Hour => write!(f, "hour"),
            Resolution::Day => write!(f, "day"),
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minute" | "min" | "m" => Ok(Resolution::Minute),
            "hour" | "h" => Ok(Resolution::Hour),
            "day" | "d" => Ok(Resolution::Day),
            _ => Err(format!("Invalid resolution: {}", s)),
        }
    }
}

/// One aggregated slot. `value` is `None` when no sample fell inside it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub value: Option<f64>,
}

/// Sleep stages reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SleepStage {
    Awake,
    Light1,
    Light2,
    Deep,
    Rem,
    Unknown,
}

impl fmt::Display for SleepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SleepStage::Awake => write!(f, "Awake"),
            SleepStage::Light1 => write!(f, "Light 1"),
            SleepStage::Light2 => write!(f, "Light 2"),
            SleepStage::Deep => write!(f, "Deep"),
            SleepStage::Rem => write!(f, "REM"),
            SleepStage::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Half-open sleep stage record `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SleepInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub stage: SleepStage,
}

impl SleepInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, stage: SleepStage) -> Self {
        Self { start, end, stage }
    }

    /// True if the interval shares at least one instant with `[start, end)`
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && self.end > start
    }
}

/// Stage attributed to one calendar minute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepMinute {
    pub minute: DateTime<Utc>,
    pub stage: SleepStage,
}

/// Standard HRV statistics for one analysis window
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HrvFeatures {
    /// Mean NN interval (ms)
    pub mean_nni: f64,

    /// Median NN interval (ms)
    pub median_nni: f64,

    /// max(NNI) - min(NNI) (ms)
    pub range_nni: f64,

    /// Sample standard deviation of NN intervals (ms)
    pub sdnn: f64,

    /// Population standard deviation of successive differences (ms)
    pub sdsd: f64,

    /// Root mean square of successive differences (ms)
    pub rmssd: f64,

    /// Successive differences larger than 50 ms
    pub nni_50: u32,

    /// Percentage of NN intervals with a successive difference above 50 ms
    pub pnni_50: f64,

    /// Successive differences larger than 20 ms
    pub nni_20: u32,

    /// Percentage of NN intervals with a successive difference above 20 ms
    pub pnni_20: f64,

    /// rmssd / mean_nni
    pub cvsd: f64,

    /// sdnn / mean_nni
    pub cvnni: f64,

    /// Heart rate statistics derived from 60000 / NNI (bpm)
    pub mean_hr: f64,
    pub min_hr: f64,
    pub max_hr: f64,
    pub std_hr: f64,

    /// Linear SDNN mapping onto [0, 10]
    pub stress_score: f64,
}

/// HRV features anchored to the start of their analysis window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HrvRecord {
    pub window_start: DateTime<Utc>,
    pub features: HrvFeatures,
}

/// ISO week identifier: the Monday the week starts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeekKey(NaiveDate);

impl WeekKey {
    /// Week containing `date`
    pub fn containing(date: NaiveDate) -> Self {
        let back = date.weekday().num_days_from_monday() as i64;
        WeekKey(date - Duration::days(back))
    }

    /// Week containing `instant` as seen from `offset`
    pub fn containing_instant(instant: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self::containing(local_date(instant, offset))
    }

    pub fn monday(&self) -> NaiveDate {
        self.0
    }

    pub fn offset_by(&self, weeks: i64) -> Self {
        WeekKey(self.0 + Duration::weeks(weeks))
    }

    pub fn pred(&self) -> Self {
        self.offset_by(-1)
    }

    pub fn succ(&self) -> Self {
        self.offset_by(1)
    }

    /// Whole weeks between `self` and `other` (absolute)
    pub fn distance(&self, other: &WeekKey) -> i64 {
        ((self.0 - other.0).num_days() / 7).abs()
    }

    /// Local Monday midnight as a UTC instant
    pub fn start_instant(&self, offset: FixedOffset) -> DateTime<Utc> {
        local_midnight(self.0, offset)
    }

    /// Exclusive end: the following Monday midnight
    pub fn end_instant(&self, offset: FixedOffset) -> DateTime<Utc> {
        self.succ().start_instant(offset)
    }

    /// Every week overlapping `[start, end)`, ascending
    pub fn spanning(start: DateTime<Utc>, end: DateTime<Utc>, offset: FixedOffset) -> Vec<WeekKey> {
        if end <= start {
            return Vec::new();
        }
        let first = Self::containing_instant(start, offset);
        let last = Self::containing_instant(end - Duration::nanoseconds(1), offset);

        let mut weeks = Vec::new();
        let mut current = first;
        while current <= last {
            weeks.push(current);
            current = current.succ();
        }
        weeks
    }
}

impl fmt::Display for WeekKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything fetched for one ISO week. Never mutated once cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekPayload {
    pub week: WeekKey,
    pub bpm: Vec<Sample>,
    pub step: Vec<Sample>,
    pub calorie: Vec<Sample>,
    pub sleep: Vec<SleepInterval>,
    pub hrv: Vec<HrvRecord>,
}

impl WeekPayload {
    /// Build a payload with every field in timestamp order
    pub fn new(
        week: WeekKey,
        mut bpm: Vec<Sample>,
        mut step: Vec<Sample>,
        mut calorie: Vec<Sample>,
        mut sleep: Vec<SleepInterval>,
        mut hrv: Vec<HrvRecord>,
    ) -> Self {
        bpm.sort_by_key(|s| s.timestamp);
        step.sort_by_key(|s| s.timestamp);
        calorie.sort_by_key(|s| s.timestamp);
        sleep.sort_by_key(|s| s.start);
        hrv.sort_by_key(|r| r.window_start);

        Self {
            week,
            bpm,
            step,
            calorie,
            sleep,
            hrv,
        }
    }

    pub fn samples(&self, metric: SampleMetric) -> &[Sample] {
        match metric {
            SampleMetric::HeartRate => &self.bpm,
            SampleMetric::Steps => &self.step,
            SampleMetric::Calories => &self.calorie,
        }
    }

    pub fn record_count(&self) -> usize {
        self.bpm.len() + self.step.len() + self.calorie.len() + self.sleep.len() + self.hrv.len()
    }
}

/// Displayed span `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateWindow {
    /// Local calendar day `date`
    pub fn day(date: NaiveDate, offset: FixedOffset) -> Self {
        let start = local_midnight(date, offset);
        Self {
            start,
            end: start + Duration::days(1),
        }
    }

    /// Monday-aligned week
    pub fn week(week: WeekKey, offset: FixedOffset) -> Self {
        Self {
            start: week.start_instant(offset),
            end: week.end_instant(offset),
        }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

/// Window granularity selected by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeSize {
    Day,
    Week,
}

impl RangeSize {
    pub fn days(&self) -> i64 {
        match self {
            RangeSize::Day => 1,
            RangeSize::Week => 7,
        }
    }
}

/// Navigation intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn sign(&self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

/// Local midnight of `date` under `offset`, as a UTC instant
pub fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN) - Duration::seconds(offset.local_minus_utc() as i64);
    Utc.from_utc_datetime(&naive)
}

/// Calendar date of `instant` under `offset`
pub fn local_date(instant: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    instant.with_timezone(&offset).date_naive()
}
