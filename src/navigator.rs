//! Date-window state machine
//!
//! Tracks the displayed [`DateWindow`] and its [`RangeSize`]. Navigation is
//! bounded by the data coverage span: a shift that would leave the window
//! partly outside `[db_start, db_end]` is rejected and the window stays put.

use crate::error::WindowError;
use crate::models::{local_date, local_midnight, DateWindow, Direction, RangeSize, WeekKey};
use chrono::{Duration, FixedOffset, NaiveDate, Offset, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Receives a prefetch request for the week around every new window
pub trait PrefetchSink: Send + Sync {
    fn request_prefetch(self: Arc<Self>, week: WeekKey);
}

/// Result of a navigation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NavigationOutcome {
    /// Window shifted to the contained value
    Moved(DateWindow),

    /// Shift would cross the coverage bounds; window unchanged
    Rejected(DateWindow),
}

impl NavigationOutcome {
    pub fn window(&self) -> DateWindow {
        match self {
            NavigationOutcome::Moved(window) | NavigationOutcome::Rejected(window) => *window,
        }
    }

    pub fn is_moved(&self) -> bool {
        matches!(self, NavigationOutcome::Moved(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Coverage {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    anchor: NaiveDate,
    window: DateWindow,
}

pub struct WindowNavigator {
    offset: FixedOffset,
    range_size: RangeSize,
    coverage: Option<Coverage>,
    position: Option<Position>,
    prefetch: Option<Arc<dyn PrefetchSink>>,
}

impl std::fmt::Debug for WindowNavigator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowNavigator")
            .field("offset", &self.offset)
            .field("range_size", &self.range_size)
            .field("coverage", &self.coverage)
            .field("position", &self.position)
            .finish()
    }
}

impl WindowNavigator {
    pub fn new(range_size: RangeSize) -> Self {
        Self {
            offset: Utc.fix(),
            range_size,
            coverage: None,
            position: None,
            prefetch: None,
        }
    }

    /// Interpret calendar dates under `offset`
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_prefetch(mut self, sink: Arc<dyn PrefetchSink>) -> Self {
        self.prefetch = Some(sink);
        self
    }

    pub fn range_size(&self) -> RangeSize {
        self.range_size
    }

    pub fn window(&self) -> Option<DateWindow> {
        self.position.map(|p| p.window)
    }

    pub fn anchor(&self) -> Option<NaiveDate> {
        self.position.map(|p| p.anchor)
    }

    pub fn coverage(&self) -> Option<(NaiveDate, NaiveDate)> {
        self.coverage.map(|c| (c.start, c.end))
    }

    pub fn is_ready(&self) -> bool {
        self.coverage.is_some()
    }

    /// Record the data coverage span.
    ///
    /// If no date has been selected yet the window opens on `db_end`.
    pub fn set_coverage(&mut self, db_start: NaiveDate, db_end: NaiveDate) -> Result<DateWindow, WindowError> {
        if db_end < db_start {
            return Err(WindowError::InvalidCoverage {
                start: db_start,
                end: db_end,
            });
        }

        self.coverage = Some(Coverage {
            start: db_start,
            end: db_end,
        });
        info!(%db_start, %db_end, "Data coverage known");

        match self.position {
            Some(position) => Ok(position.window),
            None => Ok(self.move_to(db_end)),
        }
    }

    /// Show the day or Monday-aligned week containing `date`
    pub fn select_date(&mut self, date: NaiveDate) -> Result<DateWindow, WindowError> {
        self.require_ready()?;
        debug!(%date, "Date selected");
        Ok(self.move_to(date))
    }

    /// Shift the window by one range unit
    pub fn navigate(&mut self, direction: Direction) -> Result<NavigationOutcome, WindowError> {
        let coverage = self.require_ready()?;
        let position = self.position.ok_or(WindowError::NotReady)?;

        let step = Duration::days(self.range_size.days() * direction.sign());
        let anchor = position.anchor + step;
        let candidate = self.window_for(anchor);

        if !self.within(coverage, candidate) {
            info!(
                ?direction,
                start = %candidate.start,
                end = %candidate.end,
                "Navigation rejected at coverage boundary"
            );
            return Ok(NavigationOutcome::Rejected(position.window));
        }

        Ok(NavigationOutcome::Moved(self.move_to(anchor)))
    }

    /// Recompute the window around the current anchor with `size`
    pub fn change_range_size(&mut self, size: RangeSize) -> Result<DateWindow, WindowError> {
        self.require_ready()?;
        let anchor = self.anchor().ok_or(WindowError::NotReady)?;
        self.range_size = size;
        debug!(?size, %anchor, "Range size changed");
        Ok(self.move_to(anchor))
    }

    fn require_ready(&self) -> Result<Coverage, WindowError> {
        self.coverage.ok_or(WindowError::NotReady)
    }

    fn window_for(&self, anchor: NaiveDate) -> DateWindow {
        match self.range_size {
            RangeSize::Day => DateWindow::day(anchor, self.offset),
            RangeSize::Week => DateWindow::week(WeekKey::containing(anchor), self.offset),
        }
    }

    fn within(&self, coverage: Coverage, window: DateWindow) -> bool {
        let lower = local_midnight(coverage.start, self.offset);
        let upper = local_midnight(coverage.end + Duration::days(1), self.offset);
        window.start >= lower && window.end <= upper
    }

    fn move_to(&mut self, anchor: NaiveDate) -> DateWindow {
        let window = self.window_for(anchor);
        self.position = Some(Position { anchor, window });

        let week = WeekKey::containing(local_date(window.start, self.offset));
        if let Some(sink) = &self.prefetch {
            Arc::clone(sink).request_prefetch(week);
        }
        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        requests: Mutex<Vec<WeekKey>>,
    }

    impl PrefetchSink for RecordingSink {
        fn request_prefetch(self: Arc<Self>, week: WeekKey) {
            self.requests.lock().unwrap().push(week);
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc() -> FixedOffset {
        Utc.fix()
    }

    fn ready_navigator(size: RangeSize) -> WindowNavigator {
        let mut nav = WindowNavigator::new(size);
        nav.set_coverage(date(2024, 1, 1), date(2024, 1, 31)).unwrap();
        nav
    }

    #[test]
    fn test_not_ready_before_coverage() {
        let mut nav = WindowNavigator::new(RangeSize::Week);
        assert_eq!(nav.select_date(date(2024, 1, 10)), Err(WindowError::NotReady));
        assert_eq!(nav.navigate(Direction::Forward), Err(WindowError::NotReady));
        assert_eq!(nav.change_range_size(RangeSize::Day), Err(WindowError::NotReady));
        assert!(nav.window().is_none());
    }

    #[test]
    fn test_coverage_opens_on_last_day() {
        let nav = ready_navigator(RangeSize::Day);
        assert_eq!(nav.anchor(), Some(date(2024, 1, 31)));
        assert_eq!(nav.window(), Some(DateWindow::day(date(2024, 1, 31), utc())));
    }

    #[test]
    fn test_invalid_coverage() {
        let mut nav = WindowNavigator::new(RangeSize::Day);
        assert!(matches!(
            nav.set_coverage(date(2024, 2, 1), date(2024, 1, 1)),
            Err(WindowError::InvalidCoverage { .. })
        ));
        assert!(!nav.is_ready());
    }

    #[test]
    fn test_forward_past_coverage_end_is_rejected() {
        let mut nav = ready_navigator(RangeSize::Week);
        let window = nav.select_date(date(2024, 1, 31)).unwrap();
        assert_eq!(window.start, local_midnight(date(2024, 1, 29), utc()));
        assert_eq!(window.end, local_midnight(date(2024, 2, 5), utc()));

        let outcome = nav.navigate(Direction::Forward).unwrap();
        assert_eq!(outcome, NavigationOutcome::Rejected(window));
        assert_eq!(nav.window(), Some(window));
    }

    #[test]
    fn test_backward_within_coverage_moves() {
        let mut nav = ready_navigator(RangeSize::Week);
        nav.select_date(date(2024, 1, 31)).unwrap();

        let outcome = nav.navigate(Direction::Backward).unwrap();
        assert!(outcome.is_moved());
        assert_eq!(outcome.window().start, local_midnight(date(2024, 1, 22), utc()));

        // 2024-01-01 is a Monday: the first week is fully covered
        nav.select_date(date(2024, 1, 3)).unwrap();
        let outcome = nav.navigate(Direction::Backward).unwrap();
        assert!(!outcome.is_moved());
    }

    #[test]
    fn test_day_navigation_boundaries() {
        let mut nav = ready_navigator(RangeSize::Day);
        assert!(!nav.navigate(Direction::Forward).unwrap().is_moved());

        nav.select_date(date(2024, 1, 2)).unwrap();
        assert!(nav.navigate(Direction::Backward).unwrap().is_moved());
        assert_eq!(nav.anchor(), Some(date(2024, 1, 1)));
        assert!(!nav.navigate(Direction::Backward).unwrap().is_moved());
    }

    #[test]
    fn test_week_alignment_under_offset() {
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        let mut nav = WindowNavigator::new(RangeSize::Week).with_offset(tokyo);
        nav.set_coverage(date(2024, 1, 1), date(2024, 3, 31)).unwrap();

        // Sunday
        let window = nav.select_date(date(2024, 2, 11)).unwrap();
        assert_eq!(window.start, local_midnight(date(2024, 2, 5), tokyo));
        assert_eq!(window.duration(), Duration::days(7));
    }

    #[test]
    fn test_range_size_change_keeps_anchor() {
        let mut nav = ready_navigator(RangeSize::Week);
        nav.select_date(date(2024, 1, 17)).unwrap();

        let day = nav.change_range_size(RangeSize::Day).unwrap();
        assert_eq!(day, DateWindow::day(date(2024, 1, 17), utc()));
        assert_eq!(nav.range_size(), RangeSize::Day);

        let week = nav.change_range_size(RangeSize::Week).unwrap();
        assert_eq!(week.start, local_midnight(date(2024, 1, 15), utc()));
    }

    #[test]
    fn test_transitions_request_prefetch() {
        let sink = Arc::new(RecordingSink::default());
        let mut nav = WindowNavigator::new(RangeSize::Day).with_prefetch(sink.clone());

        nav.set_coverage(date(2024, 1, 1), date(2024, 1, 31)).unwrap();
        nav.select_date(date(2024, 1, 10)).unwrap();
        nav.navigate(Direction::Forward).unwrap();
        // rejected moves do not prefetch
        nav.select_date(date(2024, 1, 31)).unwrap();
        nav.navigate(Direction::Forward).unwrap();

        let requests = sink.requests.lock().unwrap();
        assert_eq!(
            *requests,
            vec![
                WeekKey::containing(date(2024, 1, 31)),
                WeekKey::containing(date(2024, 1, 10)),
                WeekKey::containing(date(2024, 1, 11)),
                WeekKey::containing(date(2024, 1, 31)),
            ]
        );
    }
}
