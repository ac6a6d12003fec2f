//! (context × date) coverage math
//!
//! Given a combination's stored daily series and a requested window, the
//! missing dates are the set-difference of the window against the covered
//! dates, grouped into minimal contiguous sub-ranges. Each sub-range
//! becomes exactly one gap-fill fetch.

use chrono::NaiveDate;
use std::collections::BTreeSet;

use crate::types::{DateRange, DayCount};

/// Dates of the series that fall inside the window
///
/// A recorded day counts as covered even when its counts are zero.
pub fn covered_dates(series: &[DayCount], window: &DateRange) -> BTreeSet<NaiveDate> {
    series
        .iter()
        .filter(|p| window.contains(p.date))
        .map(|p| p.date)
        .collect()
}

/// Missing dates of the window, grouped into minimal contiguous sub-ranges
pub fn missing_ranges(covered: &BTreeSet<NaiveDate>, window: &DateRange) -> Vec<DateRange> {
    let mut gaps = Vec::new();
    let mut open: Option<(NaiveDate, NaiveDate)> = None;
    for day in window.iter_days() {
        if covered.contains(&day) {
            if let Some((start, end)) = open.take() {
                gaps.push(DateRange { start, end });
            }
        } else {
            open = match open {
                Some((start, _)) => Some((start, day)),
                None => Some((day, day)),
            };
        }
    }
    if let Some((start, end)) = open {
        gaps.push(DateRange { start, end });
    }
    gaps
}

/// Sum (n, k) over the window
pub fn sum_window(series: &[DayCount], window: &DateRange) -> (u64, u64) {
    series
        .iter()
        .filter(|p| window.contains(p.date))
        .fold((0, 0), |(n, k), p| (n + p.n, k + p.k))
}

/// True when every day of the window is covered
pub fn fully_covered(series: &[DayCount], window: &DateRange) -> bool {
    covered_dates(series, window).len() as u64 == window.days()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, day).unwrap()
    }

    fn series(days: impl IntoIterator<Item = u32>) -> Vec<DayCount> {
        days.into_iter()
            .map(|day| DayCount::new(d(day), 10, 1))
            .collect()
    }

    #[test]
    fn test_gap_minimality() {
        // Stored 1-10 and 20-30, requested 1-30: the only gap is 11-19
        let stored = series((1..=10).chain(20..=30));
        let window = DateRange::new(d(1), d(30)).unwrap();
        let gaps = missing_ranges(&covered_dates(&stored, &window), &window);
        assert_eq!(gaps, vec![DateRange::new(d(11), d(19)).unwrap()]);
    }

    #[test]
    fn test_no_gap_when_fully_covered() {
        let stored = series(1..=31);
        let window = DateRange::new(d(1), d(31)).unwrap();
        assert!(missing_ranges(&covered_dates(&stored, &window), &window).is_empty());
        assert!(fully_covered(&stored, &window));
    }

    #[test]
    fn test_whole_window_missing() {
        let window = DateRange::new(d(5), d(9)).unwrap();
        let gaps = missing_ranges(&BTreeSet::new(), &window);
        assert_eq!(gaps, vec![window]);
    }

    #[test]
    fn test_multiple_gaps() {
        let stored = series([1, 2, 5, 9, 10]);
        let window = DateRange::new(d(1), d(10)).unwrap();
        let gaps = missing_ranges(&covered_dates(&stored, &window), &window);
        assert_eq!(
            gaps,
            vec![
                DateRange::new(d(3), d(4)).unwrap(),
                DateRange::new(d(6), d(8)).unwrap(),
            ]
        );
    }

    #[test]
    fn test_zero_count_day_is_covered() {
        let stored = vec![DayCount::new(d(1), 0, 0)];
        let window = DateRange::new(d(1), d(1)).unwrap();
        assert!(fully_covered(&stored, &window));
    }

    #[test]
    fn test_sum_window_respects_bounds() {
        let stored = series(1..=10);
        let window = DateRange::new(d(3), d(5)).unwrap();
        assert_eq!(sum_window(&stored, &window), (30, 3));
    }
}
