//! Sleep stage resampling
//!
//! Devices report sleep as half-open stage intervals that may arrive out of
//! order, overlap slightly, or carry second-level boundaries. The resampler
//! turns them into one stage per calendar minute.
//!
//! Rules:
//! - interval starts snap to the nearest minute (`:30` and later rounds up)
//! - a minute already covered by the next interval (in start order) belongs
//!   to that interval
//! - minutes covered by nothing are [`SleepStage::Unknown`]
//! - intervals with `end <= start` contribute nothing

use crate::error::SpanError;
use crate::models::{SleepInterval, SleepMinute, SleepStage};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::trace;

const MINUTE_SECS: i64 = 60;

/// Round to the nearest minute: seconds below 30 round down, 30 and above round up
pub fn snap_to_minute(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    let floored = floor_minute(timestamp);
    if timestamp.timestamp().rem_euclid(MINUTE_SECS) < 30 {
        floored
    } else {
        floored + Duration::minutes(1)
    }
}

fn floor_minute(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp
        - Duration::seconds(timestamp.timestamp().rem_euclid(MINUTE_SECS))
        - Duration::nanoseconds(i64::from(timestamp.timestamp_subsec_nanos()))
}

/// Interval → per-minute stage timeline
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepStageResampler;

impl SleepStageResampler {
    pub fn new() -> Self {
        Self
    }

    /// One [`SleepMinute`] per whole minute of `[start, end)`.
    ///
    /// The grid starts at the minute containing `start`.
    pub fn resample(
        &self,
        intervals: &[SleepInterval],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SleepMinute>, SpanError> {
        if end < start {
            return Err(SpanError::Inverted { start, end });
        }

        let origin = floor_minute(start);
        let span_ms = (end - origin).num_milliseconds();
        let minute_count = ((span_ms + MINUTE_SECS * 1_000 - 1) / (MINUTE_SECS * 1_000)) as usize;
        let mut timeline = vec![SleepStage::Unknown; minute_count];

        let mut sorted = intervals.to_vec();
        sorted.sort_by_key(|interval| interval.start);
        let snapped: Vec<DateTime<Utc>> = sorted.iter().map(|i| snap_to_minute(i.start)).collect();

        for (index, interval) in sorted.iter().enumerate() {
            if interval.end <= interval.start {
                trace!(start = %interval.start, end = %interval.end, "Skipping empty sleep interval");
                continue;
            }

            let successor = sorted
                .get(index + 1)
                .map(|next| (snapped[index + 1], next.end));

            // Only minutes inside the output grid matter
            let mut minute = snapped[index].max(origin);
            let stop = interval.end.min(end);

            while minute < stop {
                let claimed_by_successor = successor
                    .map(|(next_start, next_end)| minute >= next_start && minute < next_end)
                    .unwrap_or(false);

                if !claimed_by_successor {
                    let slot = ((minute - origin).num_seconds() / MINUTE_SECS) as usize;
                    if let Some(stage) = timeline.get_mut(slot) {
                        *stage = interval.stage;
                    }
                }
                minute += Duration::minutes(1);
            }
        }

        Ok(timeline
            .into_iter()
            .enumerate()
            .map(|(slot, stage)| SleepMinute {
                minute: origin + Duration::minutes(slot as i64),
                stage,
            })
            .collect())
    }
}

/// Minutes spent in each stage
pub fn stage_totals(minutes: &[SleepMinute]) -> BTreeMap<SleepStage, u32> {
    let mut totals = BTreeMap::new();
    for minute in minutes {
        *totals.entry(minute.stage).or_insert(0) += 1;
    }
    totals
}
