//! Query signatures: validity tokens orthogonal to slice identity
//!
//! A stored slice is *found* by its slice key; whether its data is still
//! valid is decided by comparing a content hash of everything that went
//! into fetching it (connection identity, topology references, resolved
//! filters, granularity) against the same hash of the current query spec.
//!
//! Daily sources exclude date bounds from the hash: a 90-day fetch's
//! signature still validates a 7-day sub-query against the same topology
//! and configuration. Aggregate-only sources include bounds, because a
//! different window is a genuinely different query for them.
//!
//! A mismatched signature is a staleness heads-up, never a lookup failure:
//! the data is still used and the result carries a warning.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::types::{DateRange, Granularity};

/// One resolved filter as it would be sent to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFilter {
    /// The context key this filter realizes
    pub context: String,
    /// Canonical rendering of the filter expression
    pub descriptor: String,
}

/// Normalized description of what would be sent externally to answer one
/// atomic slice
///
/// Distinct from the slice key: the spec determines *validity* of stored
/// data, never identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQuerySpec {
    /// External connection identity (account / property / credentials id)
    pub connection_id: String,
    /// Source identifier used for filter-mapping lookup
    pub source_id: String,
    /// Funnel topology references (node identifiers along the edge)
    pub topology_nodes: Vec<String>,
    /// Experiment case splits applied to the query
    pub case_splits: Vec<String>,
    /// Resolved filter mappings, one per context constraint
    pub filters: Vec<ResolvedFilter>,
    /// Daily vs aggregate-only granularity
    pub granularity: Granularity,
    /// Date bounds; only hashed for aggregate-only specs
    pub window: Option<DateRange>,
}

impl DataQuerySpec {
    /// Canonical string with list fields sorted, so structurally-equal
    /// specs hash identically regardless of original ordering
    fn canonical_string(&self, include_window: bool) -> String {
        let mut nodes = self.topology_nodes.clone();
        nodes.sort();
        let mut cases = self.case_splits.clone();
        cases.sort();
        let mut filters: Vec<String> = self
            .filters
            .iter()
            .map(|f| format!("{}={}", f.context, f.descriptor))
            .collect();
        filters.sort();

        let window = if include_window {
            self.window
                .map(|w| w.to_string())
                .unwrap_or_else(|| "open".to_string())
        } else {
            String::new()
        };
        format!(
            "conn={};source={};nodes={};cases={};filters={};granularity={};window={}",
            self.connection_id,
            self.source_id,
            nodes.join(","),
            cases.join(","),
            filters.join(","),
            self.granularity,
            window,
        )
    }

    /// Clone with a different window
    pub fn with_window(&self, window: DateRange) -> Self {
        let mut next = self.clone();
        next.window = Some(window);
        next
    }

    /// Clone with different resolved filters
    pub fn with_filters(&self, filters: Vec<ResolvedFilter>) -> Self {
        let mut next = self.clone();
        next.filters = filters;
        next
    }
}

/// Content hash of a normalized spec, rendered as fixed-width hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuerySignature(String);

impl QuerySignature {
    fn of(canonical: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        Self(format!("{:016x}", hasher.finish()))
    }

    /// The hex form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signature for a daily-capable spec: date bounds excluded
pub fn build_daily_signature(spec: &DataQuerySpec) -> QuerySignature {
    QuerySignature::of(&spec.canonical_string(false))
}

/// Signature for an aggregate-only spec: date bounds included
pub fn build_aggregate_signature(spec: &DataQuerySpec) -> QuerySignature {
    QuerySignature::of(&spec.canonical_string(true))
}

/// Signature appropriate for the spec's own granularity
pub fn signature_for(spec: &DataQuerySpec) -> QuerySignature {
    match spec.granularity {
        Granularity::Daily => build_daily_signature(spec),
        Granularity::AggregateOnly => build_aggregate_signature(spec),
    }
}

/// Outcome of a staleness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCheck {
    /// True when the stored signature matches the current spec
    pub valid: bool,
    /// Human-readable mismatch reason when invalid
    pub reason: Option<String>,
}

/// Recompute and compare a stored signature against the current spec
///
/// Used only as a staleness heads-up, never as a lookup key.
pub fn validate_signature(stored: &QuerySignature, spec: &DataQuerySpec) -> SignatureCheck {
    let current = signature_for(spec);
    if &current == stored {
        SignatureCheck {
            valid: true,
            reason: None,
        }
    } else {
        SignatureCheck {
            valid: false,
            reason: Some(format!(
                "stored signature {} does not match current spec {}",
                stored, current
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn base_spec(granularity: Granularity) -> DataQuerySpec {
        DataQuerySpec {
            connection_id: "conn-1".to_string(),
            source_id: "ga4".to_string(),
            topology_nodes: vec!["landing".to_string(), "checkout".to_string()],
            case_splits: vec![],
            filters: vec![ResolvedFilter {
                context: "channel".to_string(),
                descriptor: "sessionSource==google".to_string(),
            }],
            granularity,
            window: Some(window(1, 31)),
        }
    }

    fn window(start_day: u32, end_day: u32) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2026, 1, start_day).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, end_day).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_daily_signature_excludes_window() {
        let a = base_spec(Granularity::Daily);
        let b = a.with_window(window(1, 7));
        assert_eq!(build_daily_signature(&a), build_daily_signature(&b));
    }

    #[test]
    fn test_aggregate_signature_includes_window() {
        let a = base_spec(Granularity::AggregateOnly);
        let b = a.with_window(window(1, 7));
        assert_ne!(build_aggregate_signature(&a), build_aggregate_signature(&b));
    }

    #[test]
    fn test_list_order_is_irrelevant() {
        let a = base_spec(Granularity::Daily);
        let mut b = a.clone();
        b.topology_nodes.reverse();
        assert_eq!(signature_for(&a), signature_for(&b));
    }

    #[test]
    fn test_filter_change_invalidates() {
        let a = base_spec(Granularity::Daily);
        let stored = signature_for(&a);
        let b = a.with_filters(vec![ResolvedFilter {
            context: "channel".to_string(),
            descriptor: "sessionSource==bing".to_string(),
        }]);
        let check = validate_signature(&stored, &b);
        assert!(!check.valid);
        assert!(check.reason.is_some());
    }

    #[test]
    fn test_validate_matching() {
        let a = base_spec(Granularity::Daily);
        let stored = signature_for(&a);
        let check = validate_signature(&stored, &a);
        assert!(check.valid);
        assert!(check.reason.is_none());
    }
}
