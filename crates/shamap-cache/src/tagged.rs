use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::stats::CacheStats;

/// Entries an insert may examine while evicting. Keeps inserts O(1) when
/// most of the cache is pinned; [`TaggedCache::sweep`] does a full pass.
const INSERT_SCAN: usize = 8;

struct Entry<V> {
    value: Arc<V>,
    touched: Instant,
}

impl<V> Entry<V> {
    fn new(value: Arc<V>) -> Self {
        Self {
            value,
            touched: Instant::now(),
        }
    }

    /// Only the cache's own reference is left.
    fn is_unpinned(&self) -> bool {
        Arc::strong_count(&self.value) == 1
    }
}

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, Entry<V>>,
    hits: u64,
    misses: u64,
}

/// A keyed cache of shared objects with recency-based eviction.
///
/// Entries are kept in least-recently-touched order. When the cache grows
/// past `target_size`, the coldest *unpinned* entries are dropped until it
/// fits again. An entry is pinned while any `Arc` handed out for it is still
/// alive, which is how a node referenced by a live map is protected.
/// Pinned entries may keep the cache above its target size; each insert
/// only looks at a few entries at the cold end, and [`sweep`](Self::sweep)
/// catches up on the rest.
///
/// A `target_size` of zero disables size-based eviction; only
/// [`sweep`](Self::sweep) removes entries then.
pub struct TaggedCache<K: Hash + Eq, V> {
    name: String,
    target_size: usize,
    target_age: Duration,
    inner: Mutex<Inner<K, V>>,
}

impl<K: Hash + Eq + Clone, V> TaggedCache<K, V> {
    /// Create an empty cache.
    pub fn new(name: impl Into<String>, target_size: usize, target_age: Duration) -> Self {
        Self {
            name: name.into(),
            target_size,
            target_age,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// The name given at construction, used in log output.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured capacity.
    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// The configured maximum idle age used by [`sweep`](Self::sweep).
    pub fn target_age(&self) -> Duration {
        self.target_age
    }

    /// Look up `key`, refreshing its recency on a hit.
    pub fn fetch(&self, key: &K) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.touched = Instant::now();
                let value = Arc::clone(&entry.value);
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Returns `true` if `key` is cached. Does not touch the entry or the
    /// hit counters.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Insert or refresh an entry. Returns `true` if the key was new.
    ///
    /// May evict the coldest unpinned entries if the cache is over capacity.
    pub fn insert(&self, key: K, value: Arc<V>) -> bool {
        let mut inner = self.inner.lock();
        let replaced = inner.entries.put(key, Entry::new(value)).is_some();
        self.evict_excess(&mut inner, INSERT_SCAN);
        !replaced
    }

    /// Return the cached object for `key` if there is one, otherwise cache
    /// `value` and return it.
    ///
    /// Callers that just built an object replace it with the returned one
    /// so that equal objects share a single allocation.
    pub fn canonicalize(&self, key: K, value: Arc<V>) -> Arc<V> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.touched = Instant::now();
            return Arc::clone(&entry.value);
        }
        inner.entries.put(key, Entry::new(Arc::clone(&value)));
        self.evict_excess(&mut inner, INSERT_SCAN);
        value
    }

    /// Store `value` under `key`, replacing any cached object. Returns
    /// `true` if an entry was replaced.
    pub fn canonicalize_replace_cache(&self, key: K, value: Arc<V>) -> bool {
        let mut inner = self.inner.lock();
        let replaced = inner.entries.put(key, Entry::new(value)).is_some();
        self.evict_excess(&mut inner, INSERT_SCAN);
        replaced
    }

    /// Remove an entry regardless of pinning. Returns `true` if it existed.
    pub fn remove(&self, key: &K) -> bool {
        self.inner.lock().entries.pop(key).is_some()
    }

    /// Drop unpinned entries idle for longer than the target age, then
    /// enforce the target size. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let stale: Vec<K> = inner
            .entries
            .iter()
            .rev()
            .filter(|(_, e)| e.is_unpinned() && now.duration_since(e.touched) > self.target_age)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            inner.entries.pop(key);
        }
        let scan = inner.entries.len();
        let removed = stale.len() + self.evict_excess(&mut inner, scan);
        debug!(
            cache = %self.name,
            removed,
            remaining = inner.entries.len(),
            "cache sweep"
        );
        removed
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Remove every entry and reset counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    /// Current size and hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    /// Drop the coldest unpinned entries while over the target size,
    /// looking at no more than `max_scan` entries. A pinned entry found at
    /// the cold end is moved to the warm end, so the next scan starts past
    /// it.
    fn evict_excess(&self, inner: &mut Inner<K, V>, max_scan: usize) -> usize {
        if self.target_size == 0 {
            return 0;
        }
        let mut evicted = 0;
        for _ in 0..max_scan {
            if inner.entries.len() <= self.target_size {
                break;
            }
            let Some((key, entry)) = inner.entries.peek_lru() else {
                break;
            };
            if entry.is_unpinned() {
                inner.entries.pop_lru();
                evicted += 1;
            } else {
                let key = key.clone();
                inner.entries.promote(&key);
            }
        }
        evicted
    }
}

impl<K: Hash + Eq, V> std::fmt::Debug for TaggedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedCache")
            .field("name", &self.name)
            .field("target_size", &self.target_size)
            .field("size", &self.inner.lock().entries.len())
            .finish()
    }
}
