//! Core data types used throughout the aggregation engine
//!
//! This module defines the fundamental data structures shared across the
//! system:
//!
//! # Key Types
//!
//! - **`SliceKey`**: canonical identity of one atomic slice
//! - **`ConfigId`**: identity of one persisted configuration
//! - **`DateRange`**: inclusive day-granular window for queries
//! - **`DayCount`**: one day's (n, k) measurement
//! - **`Granularity`**: daily vs aggregate-only data shape
//! - **`SourceCapability`**: what an external source can answer
//! - **`AggregationStatus`**: soundness of an aggregated answer
//!
//! # Example
//!
//! ```rust
//! use funnelgrid::types::{DateRange, DayCount};
//! use chrono::NaiveDate;
//!
//! let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
//! let end = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
//! let range = DateRange::new(start, end).unwrap();
//! assert_eq!(range.days(), 31);
//! assert!(range.contains(NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()));
//! ```

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreError;

/// Canonical identity of one atomic slice
///
/// A `SliceKey` is the deterministic re-serialization of a parsed constraint
/// set: constraints in canonical order, lists sorted, dates in one format.
/// Two semantically identical expressions always produce the same key.
///
/// Keys are produced by `dsl::normalize` / `ParsedConstraintSet::slice_key`
/// and are the *identity* of stored data. Whether that data is still valid
/// is tracked separately by a query signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SliceKey(String);

impl SliceKey {
    /// Wrap an already-canonical string
    ///
    /// Callers outside the DSL layer should obtain keys from
    /// `dsl::normalize` rather than constructing them directly.
    pub fn from_canonical(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The canonical string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty (fully unconstrained) key
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one persisted configuration
///
/// Stored slices live inside a configuration document alongside the funnel
/// topology; the in-memory cache indexes per configuration and invalidates
/// per configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigId(String);

impl ConfigId {
    /// Create a configuration id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive day-granular date range
///
/// Both endpoints are part of the range: 1-Jan..31-Jan covers 31 days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    /// First day of the range (inclusive)
    pub start: NaiveDate,
    /// Last day of the range (inclusive)
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a range, rejecting start > end
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, StoreError> {
        if start > end {
            return Err(StoreError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// Number of days covered (inclusive of both endpoints)
    pub fn days(&self) -> u64 {
        (self.end - self.start).num_days() as u64 + 1
    }

    /// True if the date falls inside the range
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Iterate every day of the range in order
    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start
            .iter_days()
            .take_while(move |d| *d <= end)
    }

    /// Intersection with another range, if any
    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start <= end {
            Some(DateRange { start, end })
        } else {
            None
        }
    }

    /// Number of days shared with another range
    pub fn overlap_days(&self, other: &DateRange) -> u64 {
        self.intersect(other).map(|r| r.days()).unwrap_or(0)
    }

    /// The range shifted so it ends the given number of days before `end`
    ///
    /// Convenience for building lookback windows in tests and demos.
    pub fn lookback(end: NaiveDate, days: u64) -> Self {
        let start = end
            .checked_sub_days(Days::new(days.saturating_sub(1)))
            .unwrap_or(end);
        Self { start, end }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

/// One day's measurement: `n` trials, `k` successes
///
/// For a funnel edge, `n` is the number of sessions reaching the source
/// node and `k` the number continuing to the target node. Cost and
/// duration measurements reuse the same shape with their own units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayCount {
    /// The day this measurement covers
    pub date: NaiveDate,
    /// Trial count
    pub n: u64,
    /// Success count
    pub k: u64,
}

impl DayCount {
    /// Create a day count
    pub fn new(date: NaiveDate, n: u64, k: u64) -> Self {
        Self { date, n, k }
    }
}

/// Data shape a query resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    /// Per-day counts: enables incremental gap-fill
    Daily,
    /// One number per requested window
    AggregateOnly,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Daily => write!(f, "daily"),
            Granularity::AggregateOnly => write!(f, "aggregate"),
        }
    }
}

/// What an external source can answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceCapability {
    /// The source reports per-day counts
    pub daily: bool,
    /// The source accepts arbitrary date windows (vs fixed coarse windows)
    pub arbitrary_window: bool,
}

impl SourceCapability {
    /// A daily-capable source (arbitrary windows implied)
    pub fn daily() -> Self {
        Self {
            daily: true,
            arbitrary_window: true,
        }
    }

    /// An aggregate-only source that accepts arbitrary windows
    pub fn aggregate_arbitrary() -> Self {
        Self {
            daily: false,
            arbitrary_window: true,
        }
    }

    /// An aggregate-only source limited to fixed coarse windows
    pub fn aggregate_fixed() -> Self {
        Self {
            daily: false,
            arbitrary_window: false,
        }
    }
}

/// Soundness of an aggregated answer
///
/// `Partial` and `Prorated` results must be visually distinguishable from
/// `Complete` and `MeceAggregated` downstream, but numbers are always
/// returned once a query passes parsing and registry validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationStatus {
    /// A single fully-covered slice answered the query
    Complete,
    /// Slices of one complete MECE value set were summed into a true total
    MeceAggregated,
    /// Data was missing or set-incomplete; the answer is not a true total
    Partial,
    /// An aggregate-only answer was linearly scaled by time overlap
    Prorated,
}

impl fmt::Display for AggregationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationStatus::Complete => write!(f, "complete"),
            AggregationStatus::MeceAggregated => write!(f, "mece-aggregated"),
            AggregationStatus::Partial => write!(f, "partial"),
            AggregationStatus::Prorated => write!(f, "prorated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_range_days_inclusive() {
        let r = DateRange::new(d(2026, 1, 1), d(2026, 1, 31)).unwrap();
        assert_eq!(r.days(), 31);
        let one = DateRange::new(d(2026, 1, 1), d(2026, 1, 1)).unwrap();
        assert_eq!(one.days(), 1);
    }

    #[test]
    fn test_range_rejects_inverted() {
        assert!(DateRange::new(d(2026, 2, 1), d(2026, 1, 1)).is_err());
    }

    #[test]
    fn test_range_overlap() {
        let a = DateRange::new(d(2026, 1, 1), d(2026, 1, 31)).unwrap();
        let b = DateRange::new(d(2026, 1, 15), d(2026, 2, 15)).unwrap();
        assert_eq!(a.overlap_days(&b), 17);
        let c = DateRange::new(d(2026, 3, 1), d(2026, 3, 2)).unwrap();
        assert_eq!(a.overlap_days(&c), 0);
    }

    #[test]
    fn test_iter_days() {
        let r = DateRange::new(d(2026, 1, 30), d(2026, 2, 2)).unwrap();
        let days: Vec<NaiveDate> = r.iter_days().collect();
        assert_eq!(days.len(), 4);
        assert_eq!(days[0], d(2026, 1, 30));
        assert_eq!(days[3], d(2026, 2, 2));
    }

    #[test]
    fn test_lookback() {
        let r = DateRange::lookback(d(2026, 1, 10), 10);
        assert_eq!(r.start, d(2026, 1, 1));
        assert_eq!(r.days(), 10);
    }
}
