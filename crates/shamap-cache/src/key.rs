use std::hash::Hash;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// A recency-ordered set of keys.
///
/// Same eviction rules as [`TaggedCache`](crate::TaggedCache) minus
/// pinning: over `target_size` the oldest keys go first, and
/// [`sweep`](Self::sweep) drops keys idle for longer than `target_age`.
pub struct KeyCache<K: Hash + Eq> {
    name: String,
    target_size: usize,
    target_age: Duration,
    keys: Mutex<LruCache<K, Instant>>,
}

impl<K: Hash + Eq + Clone> KeyCache<K> {
    /// Create an empty key cache. A `target_size` of zero means unbounded.
    pub fn new(name: impl Into<String>, target_size: usize, target_age: Duration) -> Self {
        Self {
            name: name.into(),
            target_size,
            target_age,
            keys: Mutex::new(LruCache::unbounded()),
        }
    }

    /// The name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or refresh a key. Returns `true` if the key was new.
    pub fn insert(&self, key: K) -> bool {
        let mut keys = self.keys.lock();
        let fresh = keys.put(key, Instant::now()).is_none();
        if self.target_size != 0 {
            while keys.len() > self.target_size {
                keys.pop_lru();
            }
        }
        fresh
    }

    /// Refresh `key` if present. Returns `true` if it was present.
    pub fn touch_if_exists(&self, key: &K) -> bool {
        match self.keys.lock().get_mut(key) {
            Some(touched) => {
                *touched = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Returns `true` if `key` is present, without refreshing it.
    pub fn contains(&self, key: &K) -> bool {
        self.keys.lock().contains(key)
    }

    /// Remove a key. Returns `true` if it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.keys.lock().pop(key).is_some()
    }

    /// Drop keys idle for longer than the target age.
    pub fn sweep(&self) -> usize {
        let mut keys = self.keys.lock();
        let now = Instant::now();
        let mut removed = 0;
        loop {
            let expired = match keys.peek_lru() {
                Some((_, touched)) => now.duration_since(*touched) > self.target_age,
                None => false,
            };
            if !expired {
                break;
            }
            keys.pop_lru();
            removed += 1;
        }
        removed
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    /// Returns `true` if no keys are held.
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    /// Forget every key.
    pub fn clear(&self) {
        self.keys.lock().clear();
    }
}

impl<K: Hash + Eq> std::fmt::Debug for KeyCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("name", &self.name)
            .field("target_size", &self.target_size)
            .finish()
    }
}
