//! Fixed-width time bucketing with explicit gaps
//!
//! Raw samples are grouped into minute, hour or day buckets and reduced per
//! metric (mean for rates, sum for counts). Every bucket boundary of the
//! requested span is emitted, so the output length depends only on the span
//! and resolution. Buckets without samples carry `None`, never zero.

use crate::error::SpanError;
use crate::models::{Bucket, Reduction, Resolution, Sample, SampleMetric};
use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Start of the bucket containing `timestamp`.
///
/// Boundaries are placed in the local time of `offset`; the result is still a
/// UTC instant.
pub fn floor_to_resolution(
    timestamp: DateTime<Utc>,
    resolution: Resolution,
    offset: FixedOffset,
) -> Result<DateTime<Utc>, SpanError> {
    let step = resolution.seconds();
    let shift = offset.local_minus_utc() as i64;
    let local = timestamp.timestamp() + shift;
    let floored = local - local.rem_euclid(step) - shift;

    DateTime::<Utc>::from_timestamp(floored, 0).ok_or(SpanError::OutOfRange { seconds: floored })
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    sum: f64,
    count: u32,
}

impl Accumulator {
    fn resolve(&self, reduction: Reduction) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        match reduction {
            Reduction::Sum => Some(self.sum),
            Reduction::Mean => Some(self.sum / self.count as f64),
        }
    }
}

/// Sample → bucket aggregator for a single metric and resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBucketAggregator {
    resolution: Resolution,
    reduction: Reduction,
    offset: FixedOffset,
}

impl TimeBucketAggregator {
    /// Aggregator with UTC boundaries
    pub fn new(resolution: Resolution, reduction: Reduction) -> Self {
        Self {
            resolution,
            reduction,
            offset: Utc.fix(),
        }
    }

    /// Aggregator using the metric's reduction policy
    pub fn for_metric(metric: SampleMetric, resolution: Resolution) -> Self {
        Self::new(resolution, metric.reduction())
    }

    /// Place bucket boundaries in the local time of `offset`
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Number of buckets emitted for `[start, end)`
    pub fn bucket_count(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        let step_ms = self.resolution.seconds() * 1_000;
        let span_ms = (end - start).num_milliseconds().max(0);
        ((span_ms + step_ms - 1) / step_ms) as usize
    }

    /// Bucket `samples` over `[start, end)`.
    ///
    /// `start` must sit on a bucket boundary. Samples outside the span are
    /// ignored.
    pub fn aggregate(
        &self,
        samples: &[Sample],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bucket>, SpanError> {
        if end < start {
            return Err(SpanError::Inverted { start, end });
        }
        if floor_to_resolution(start, self.resolution, self.offset)? != start {
            return Err(SpanError::Misaligned {
                start,
                resolution: self.resolution.to_string(),
            });
        }

        let step = self.resolution.seconds();
        let count = self.bucket_count(start, end) as i64;
        let origin = start.timestamp();

        let mut buckets: BTreeMap<i64, Accumulator> = BTreeMap::new();
        for sample in samples {
            if sample.timestamp < start || sample.timestamp >= end {
                continue;
            }
            let index = (sample.timestamp.timestamp() - origin).div_euclid(step);
            buckets
                .entry(index)
                .and_modify(|acc| {
                    acc.sum += sample.value;
                    acc.count += 1;
                })
                .or_insert(Accumulator {
                    sum: sample.value,
                    count: 1,
                });
        }

        let series = (0..count)
            .map(|index| Bucket {
                start: start + Duration::seconds(index * step),
                value: buckets
                    .get(&index)
                    .and_then(|acc| acc.resolve(self.reduction)),
            })
            .collect();

        Ok(series)
    }
}

/// Observed and predicted value at one timestamp
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergedPoint {
    pub timestamp: DateTime<Utc>,
    pub actual: Option<f64>,
    pub predicted: Option<f64>,
}

/// Join observed buckets with an externally supplied prediction series.
///
/// The result holds one point per distinct timestamp, ascending. When the
/// prediction series repeats a timestamp the last value wins.
pub fn merge_with_predictions(actual: &[Bucket], predicted: &[Sample]) -> Vec<MergedPoint> {
    let mut merged: BTreeMap<DateTime<Utc>, MergedPoint> = BTreeMap::new();

    for bucket in actual {
        merged
            .entry(bucket.start)
            .or_insert(MergedPoint {
                timestamp: bucket.start,
                actual: None,
                predicted: None,
            })
            .actual = bucket.value;
    }

    for sample in predicted {
        merged
            .entry(sample.timestamp)
            .or_insert(MergedPoint {
                timestamp: sample.timestamp,
                actual: None,
                predicted: None,
            })
            .predicted = Some(sample.value);
    }

    merged.into_values().collect()
}
