//! Stored slices: the persisted measurement collection
//!
//! Stored slices live in the same persisted configuration document as the
//! funnel topology; this module models that collection as mutable and
//! append-friendly. The engine only appends and merges; it never
//! partially deletes a slice. File formats, versioning, and transactions
//! belong to the external configuration store.
//!
//! Merge policy for overlapping daily data is latest-write-wins by date.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::signature::QuerySignature;
use crate::types::{ConfigId, DateRange, DayCount, SliceKey};

/// Measured data carried by one stored slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SliceData {
    /// Daily series, sorted by date, one entry per date
    Daily(Vec<DayCount>),
    /// One (n, k) pair for a whole window
    Aggregate {
        /// The window the pair covers
        window: DateRange,
        /// Trial count
        n: u64,
        /// Success count
        k: u64,
    },
}

/// Persisted record of one slice's measurements
///
/// Created on first fetch; updated by append/overwrite-by-date merges;
/// never partially deleted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSlice {
    /// Canonical identity
    pub key: SliceKey,
    /// Validity token from the fetch that produced the data
    pub signature: Option<QuerySignature>,
    /// The measurements
    pub data: SliceData,
}

impl StoredSlice {
    /// The daily series, when this slice is daily
    pub fn daily(&self) -> Option<&[DayCount]> {
        match &self.data {
            SliceData::Daily(points) => Some(points),
            SliceData::Aggregate { .. } => None,
        }
    }

    /// The aggregate triple, when this slice is aggregate-only
    pub fn aggregate(&self) -> Option<(DateRange, u64, u64)> {
        match &self.data {
            SliceData::Aggregate { window, n, k } => Some((*window, *n, *k)),
            SliceData::Daily(_) => None,
        }
    }
}

/// The stored-slice collection of one configuration
#[derive(Debug, Clone)]
pub struct SliceStore {
    config: ConfigId,
    slices: Vec<StoredSlice>,
}

impl SliceStore {
    /// An empty collection for one configuration
    pub fn new(config: ConfigId) -> Self {
        Self {
            config,
            slices: Vec::new(),
        }
    }

    /// The owning configuration
    pub fn config(&self) -> &ConfigId {
        &self.config
    }

    /// All stored slices
    pub fn slices(&self) -> &[StoredSlice] {
        &self.slices
    }

    /// Number of stored slices
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Find a slice by exact key
    pub fn find(&self, key: &SliceKey) -> Option<&StoredSlice> {
        self.slices.iter().find(|s| &s.key == key)
    }

    /// Merge daily points into the slice for `key`, creating it if absent
    ///
    /// Points overwrite existing entries with the same date (latest write
    /// wins); the series stays sorted and date-unique. Merging into an
    /// aggregate-only slice is an error.
    pub fn merge_daily(
        &mut self,
        key: &SliceKey,
        signature: Option<QuerySignature>,
        points: Vec<DayCount>,
    ) -> Result<(), StoreError> {
        let slice = match self.slices.iter_mut().find(|s| &s.key == key) {
            Some(slice) => slice,
            None => {
                self.slices.push(StoredSlice {
                    key: key.clone(),
                    signature,
                    data: SliceData::Daily(Vec::new()),
                });
                self.slices.last_mut().expect("just pushed")
            },
        };
        let series = match &mut slice.data {
            SliceData::Daily(series) => series,
            SliceData::Aggregate { .. } => {
                return Err(StoreError::GranularityMismatch(key.to_string()))
            },
        };
        for point in points {
            match series.binary_search_by_key(&point.date, |p| p.date) {
                Ok(i) => series[i] = point,
                Err(i) => series.insert(i, point),
            }
        }
        debug!(key = %key, days = series.len(), "merged daily points");
        Ok(())
    }

    /// Store or replace the aggregate pair for `key`
    ///
    /// Replacing a daily slice with an aggregate is an error.
    pub fn put_aggregate(
        &mut self,
        key: &SliceKey,
        signature: Option<QuerySignature>,
        window: DateRange,
        n: u64,
        k: u64,
    ) -> Result<(), StoreError> {
        match self.slices.iter_mut().find(|s| &s.key == key) {
            Some(slice) => {
                if matches!(slice.data, SliceData::Daily(_)) {
                    return Err(StoreError::GranularityMismatch(key.to_string()));
                }
                slice.signature = signature;
                slice.data = SliceData::Aggregate { window, n, k };
            },
            None => self.slices.push(StoredSlice {
                key: key.clone(),
                signature,
                data: SliceData::Aggregate { window, n, k },
            }),
        }
        Ok(())
    }

    /// Seed a complete slice (tests, external persistence load)
    pub fn insert(&mut self, slice: StoredSlice) {
        self.slices.retain(|s| s.key != slice.key);
        self.slices.push(slice);
    }
}
