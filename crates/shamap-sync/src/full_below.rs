use std::time::Duration;

use shamap_cache::KeyCache;
use shamap_types::Hash256;

/// Hashes of inner nodes whose whole subtree is known to be stored
/// locally.
///
/// Acquisition consults it to skip subtrees it has already walked to the
/// bottom. Only hashes are kept, so an entry stays valid for every map
/// that contains the same subtree.
pub struct FullBelowCache {
    keys: KeyCache<Hash256>,
}

impl FullBelowCache {
    /// A `target_size` of zero means unbounded.
    pub fn new(target_size: usize, target_age: Duration) -> Self {
        Self {
            keys: KeyCache::new("full-below", target_size, target_age),
        }
    }

    /// Record that everything below `hash` is local.
    pub fn insert(&self, hash: Hash256) -> bool {
        self.keys.insert(hash)
    }

    /// Returns `true`, and refreshes the entry, if `hash` is known complete.
    pub fn touch_if_exists(&self, hash: &Hash256) -> bool {
        self.keys.touch_if_exists(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.keys.contains(hash)
    }

    /// Drop entries idle for longer than the target age.
    pub fn sweep(&self) -> usize {
        self.keys.sweep()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&self) {
        self.keys.clear();
    }
}

impl Default for FullBelowCache {
    fn default() -> Self {
        Self::new(524_288, Duration::from_secs(600))
    }
}
