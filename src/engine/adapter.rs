//! The source-adapter seam
//!
//! The engine emits atomic fetch requests and expects daily points back;
//! it is agnostic to wire protocol, auth, and provider filter syntax.
//! Adapters translate a registry filter descriptor into provider-native
//! syntax and perform the actual IO.
//!
//! A fetch failure never aborts an aggregation: it is reported
//! per-combination and folds into the result's warnings.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::signature::DataQuerySpec;
use crate::types::{DateRange, DayCount, SliceKey};

/// One atomic fetch handed to an external adapter
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Storage key of the slice this fetch fills
    pub key: SliceKey,
    /// The concrete context combination being fetched
    pub combination: BTreeMap<String, String>,
    /// The contiguous date sub-range to fetch
    pub range: DateRange,
    /// The normalized spec the adapter translates into provider syntax
    pub spec: DataQuerySpec,
}

/// Successful fetch payload
#[derive(Debug, Clone, Default)]
pub struct FetchReply {
    /// Per-day counts inside the requested range
    ///
    /// Aggregate-only sources return a single point dated at the range
    /// start carrying the whole window's counts.
    pub daily_points: Vec<DayCount>,
}

/// One external fetch failed
///
/// Deliberately not part of the crate's error hierarchy: the engine
/// recovers locally by omitting the combination's contribution.
#[derive(Debug, Clone)]
pub struct FetchError {
    /// What the adapter reported
    pub message: String,
}

impl FetchError {
    /// Create a fetch error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch failed: {}", self.message)
    }
}

impl std::error::Error for FetchError {}

/// External analytics source
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Execute one atomic fetch
    async fn fetch(&self, request: FetchRequest) -> Result<FetchReply, FetchError>;
}

// ============================================================================
// In-memory adapter (tests, demos)
// ============================================================================

/// Deterministic in-process source
///
/// Serves seeded per-key daily data, optionally a constant fallback count
/// for unseeded keys, and records every request it sees so tests can
/// assert gap-fill minimality.
#[derive(Debug, Default)]
pub struct InMemorySource {
    data: HashMap<SliceKey, Vec<DayCount>>,
    failing: HashSet<SliceKey>,
    fallback: Option<(u64, u64)>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl InMemorySource {
    /// An empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed daily data for one key
    pub fn with_series(mut self, key: SliceKey, points: Vec<DayCount>) -> Self {
        self.data.insert(key, points);
        self
    }

    /// Make every fetch for one key fail
    pub fn with_failure(mut self, key: SliceKey) -> Self {
        self.failing.insert(key);
        self
    }

    /// Serve a constant (n, k) per day for keys with no seeded series
    pub fn with_fallback(mut self, n: u64, k: u64) -> Self {
        self.fallback = Some((n, k));
        self
    }

    /// Every request issued so far
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    /// Number of fetches issued
    pub fn fetch_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl SourceAdapter for InMemorySource {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchReply, FetchError> {
        self.requests.lock().push(request.clone());
        if self.failing.contains(&request.key) {
            return Err(FetchError::new(format!(
                "simulated failure for {}",
                request.key
            )));
        }
        if let Some(points) = self.data.get(&request.key) {
            let daily_points = points
                .iter()
                .filter(|p| request.range.contains(p.date))
                .copied()
                .collect();
            return Ok(FetchReply { daily_points });
        }
        if let Some((n, k)) = self.fallback {
            let daily_points = request
                .range
                .iter_days()
                .map(|date| DayCount::new(date, n, k))
                .collect();
            return Ok(FetchReply { daily_points });
        }
        // Known key, no data: an empty reply, not a failure
        Ok(FetchReply::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Granularity;
    use chrono::NaiveDate;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, day).unwrap()
    }

    fn request(key: &str, start: u32, end: u32) -> FetchRequest {
        FetchRequest {
            key: SliceKey::from_canonical(key),
            combination: BTreeMap::new(),
            range: DateRange::new(d(start), d(end)).unwrap(),
            spec: DataQuerySpec {
                connection_id: "c".to_string(),
                source_id: "s".to_string(),
                topology_nodes: vec![],
                case_splits: vec![],
                filters: vec![],
                granularity: Granularity::Daily,
                window: None,
            },
        }
    }

    #[tokio::test]
    async fn test_seeded_series_clipped_to_range() {
        let source = InMemorySource::new().with_series(
            SliceKey::from_canonical("k"),
            (1..=10).map(|day| DayCount::new(d(day), 5, 1)).collect(),
        );
        let reply = source.fetch(request("k", 3, 5)).await.unwrap();
        assert_eq!(reply.daily_points.len(), 3);
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let source = InMemorySource::new().with_failure(SliceKey::from_canonical("k"));
        assert!(source.fetch(request("k", 1, 2)).await.is_err());
    }

    #[tokio::test]
    async fn test_fallback_fills_whole_range() {
        let source = InMemorySource::new().with_fallback(100, 10);
        let reply = source.fetch(request("k", 1, 7)).await.unwrap();
        assert_eq!(reply.daily_points.len(), 7);
        assert_eq!(reply.daily_points[0].n, 100);
    }
}
