//! In-memory slice index
//!
//! A lazily built per-configuration index from slice key to stored slice:
//! O(#stored slices) to build on first lookup, O(1) afterwards. The index
//! is derived and disposable: it has no persistence of its own and is
//! invalidated wholesale on any mutation of a configuration's stored
//! slices (coarse-grained, not field-level).
//!
//! The cache is an explicit object handed to the aggregation entry point
//! by reference, never ambient module state.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::store::{SliceStore, StoredSlice};
use crate::types::{ConfigId, SliceKey};

type ConfigIndex = HashMap<SliceKey, Arc<StoredSlice>>;

/// Per-configuration slice index
#[derive(Debug, Default)]
pub struct SliceCache {
    index: RwLock<HashMap<ConfigId, Arc<ConfigIndex>>>,
}

impl SliceCache {
    /// An empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a stored slice by exact key, building the configuration's
    /// index on first access
    pub fn slice_for(&self, store: &SliceStore, key: &SliceKey) -> Option<Arc<StoredSlice>> {
        if let Some(index) = self.index.read().get(store.config()) {
            return index.get(key).cloned();
        }
        let index = self.build(store);
        index.get(key).cloned()
    }

    /// Drop the index of one configuration
    ///
    /// Called after any mutation of that configuration's stored slices;
    /// the next lookup rebuilds.
    pub fn invalidate(&self, config: &ConfigId) {
        if self.index.write().remove(config).is_some() {
            debug!(config = %config, "slice cache invalidated");
        }
    }

    /// Number of configurations currently indexed
    pub fn configs_indexed(&self) -> usize {
        self.index.read().len()
    }

    fn build(&self, store: &SliceStore) -> Arc<ConfigIndex> {
        let built: ConfigIndex = store
            .slices()
            .iter()
            .map(|s| (s.key.clone(), Arc::new(s.clone())))
            .collect();
        debug!(
            config = %store.config(),
            slices = built.len(),
            "built slice index"
        );
        let built = Arc::new(built);
        let mut guard = self.index.write();
        // A concurrent build may have won; keep whichever is present
        Arc::clone(guard.entry(store.config().clone()).or_insert(built))
    }
}
