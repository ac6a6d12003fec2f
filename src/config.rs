//! Engine configuration with TOML support
//!
//! This module provides configuration file support with TOML format and
//! sensible per-field defaults, so a missing file or a sparse file both
//! yield a working engine.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Tunable knobs of the aggregation engine
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Maximum number of atomic slices one compound expression may explode
    /// to before a warning is attached (the explosion still completes)
    #[serde(default = "default_explosion_cap")]
    pub explosion_cap: usize,

    /// Maximum number of gap-fill fetches in flight at once
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Compare stored signatures against the current query spec and attach
    /// staleness warnings on mismatch
    #[serde(default = "default_true")]
    pub check_staleness: bool,

    /// Allow linear time-overlap proration for aggregate-only sources with
    /// fixed coarse windows
    #[serde(default = "default_true")]
    pub allow_proration: bool,
}

fn default_explosion_cap() -> usize {
    500
}

fn default_max_concurrent_fetches() -> usize {
    8
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            explosion_cap: default_explosion_cap(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            check_staleness: true,
            allow_proration: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Set the explosion cap
    pub fn with_explosion_cap(mut self, cap: usize) -> Self {
        self.explosion_cap = cap;
        self
    }

    /// Set the fetch fan-out limit
    pub fn with_max_concurrent_fetches(mut self, n: usize) -> Self {
        self.max_concurrent_fetches = n.max(1);
        self
    }

    /// Disable staleness checking
    pub fn without_staleness_checks(mut self) -> Self {
        self.check_staleness = false;
        self
    }
}
