//! Keyed registry of independently lockable entries
//!
//! Buckets, abuse standings and per-request locks each live in a registry
//! owned by the component that uses them. The outer map is only locked long
//! enough to find or create an entry; callers then lock the entry on its own,
//! so two keys never share a critical section.

use crate::StoreError;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// Lazily populated map from key to shared entry
pub struct Registry<K, V> {
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the entry for `key`, creating it with `init` on first use
    pub fn get_or_insert_with(
        &self,
        key: &K,
        init: impl FnOnce() -> V,
    ) -> Result<Arc<V>, StoreError> {
        {
            let entries = self.entries.read().map_err(StoreError::poisoned)?;
            if let Some(entry) = entries.get(key) {
                return Ok(Arc::clone(entry));
            }
        }
        let mut entries = self.entries.write().map_err(StoreError::poisoned)?;
        Ok(Arc::clone(
            entries.entry(key.clone()).or_insert_with(|| Arc::new(init())),
        ))
    }

    /// Fetch the entry for `key` without creating it
    pub fn get(&self, key: &K) -> Result<Option<Arc<V>>, StoreError> {
        let entries = self.entries.read().map_err(StoreError::poisoned)?;
        Ok(entries.get(key).cloned())
    }

    /// Drop entries the predicate rejects
    pub fn retain(&self, mut keep: impl FnMut(&K, &Arc<V>) -> bool) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().map_err(StoreError::poisoned)?;
        let before = entries.len();
        entries.retain(|k, v| keep(k, v));
        Ok(before - entries.len())
    }

    /// Drop entries the predicate rejects, unless a caller still holds them.
    ///
    /// New handles are only handed out under the map lock, so an entry with
    /// no outside handle here cannot gain a writer while it is removed.
    pub fn retain_idle(&self, mut keep: impl FnMut(&K, &Arc<V>) -> bool) -> Result<usize, StoreError> {
        self.retain(|k, entry| Arc::strong_count(entry) > 1 || keep(k, entry))
    }

    /// Drop entries nobody outside the registry holds
    pub fn prune_unused(&self) -> Result<usize, StoreError> {
        self.retain_idle(|_, _| false)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Check if the registry holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Teardown: forget every entry
    pub fn clear(&self) -> Result<(), StoreError> {
        self.entries.write().map_err(StoreError::poisoned)?.clear();
        Ok(())
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
