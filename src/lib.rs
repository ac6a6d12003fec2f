//! Funnelgrid - Context-aware conversion-funnel measurement aggregation
//!
//! This library measures conversion funnels whose data is partitioned by
//! qualitative context (traffic channel, device class, experiment arm):
//! - Constraint DSL with compound OR-expansion and context selections
//! - Context registry with MECE other-bucket policies
//! - Query signatures separating slice identity from data validity
//! - (context x date) coverage tracking with minimal-gap fetch planning
//! - MECE partition totals, proration for coarse-window sources

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod dsl;
pub mod engine;
pub mod error;
pub mod signature;
pub mod stats;
pub mod store;
pub mod types;

/// Engine configuration with TOML support
pub mod config;

/// Context registry: keys, legal values, other-bucket policies, and
/// per-source filter mappings
pub mod registry;

// Re-export main types
pub use cache::SliceCache;
pub use config::EngineConfig;
pub use engine::adapter::{FetchReply, FetchRequest, SourceAdapter};
pub use engine::{
    AggregateMode, AggregateRequest, AggregationEngine, AggregationResult, AggregationWarning,
};
pub use error::{Error, Result};
pub use registry::ContextRegistry;
pub use signature::{DataQuerySpec, QuerySignature};
pub use store::SliceStore;
pub use types::{AggregationStatus, DateRange, DayCount, SliceKey};

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_sanity() {
        assert_eq!(2 + 2, 4);
    }
}
