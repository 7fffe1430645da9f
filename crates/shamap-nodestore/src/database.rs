use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use shamap_cache::TaggedCache;
use shamap_types::Hash256;
use tracing::{debug, trace};

use crate::config::{make_backend, NodeStoreConfig};
use crate::error::NodeStoreResult;
use crate::object::{NodeObject, NodeObjectType};
use crate::traits::Backend;

/// Objects per backend commit when copying between databases.
const IMPORT_BATCH: usize = 1024;

/// Counters reported by [`NodeDatabase::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeStoreStats {
    pub fetch_total: u64,
    pub fetch_hits: u64,
    pub store_count: u64,
    pub store_bytes: u64,
    pub cache_size: usize,
}

/// The node store as seen by the tree layer: a backend plus a cache of
/// decoded objects.
///
/// Fetches consult the cache before the backend; writes go to the backend
/// first and are cached once durable. One instance is created at startup
/// and shared by reference with every map.
pub struct NodeDatabase {
    backend: Arc<dyn Backend>,
    cache: TaggedCache<Hash256, NodeObject>,
    fetch_total: AtomicU64,
    fetch_hits: AtomicU64,
    store_count: AtomicU64,
    store_bytes: AtomicU64,
}

impl NodeDatabase {
    pub fn new(backend: Arc<dyn Backend>, cache_size: usize, cache_age: Duration) -> Self {
        let cache = TaggedCache::new(format!("{}-objects", backend.name()), cache_size, cache_age);
        Self {
            backend,
            cache,
            fetch_total: AtomicU64::new(0),
            fetch_hits: AtomicU64::new(0),
            store_count: AtomicU64::new(0),
            store_bytes: AtomicU64::new(0),
        }
    }

    /// Build the backend described by `config` and wrap it.
    pub fn open(config: &NodeStoreConfig) -> NodeStoreResult<Self> {
        let backend = make_backend(config)?;
        Ok(Self::new(backend, config.cache_size, config.cache_age()))
    }

    /// An unbounded in-memory database, mostly for tests.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(crate::memory::MemoryBackend::new()),
            0,
            Duration::from_secs(300),
        )
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Fetch an object by hash.
    pub fn fetch(&self, hash: &Hash256) -> NodeStoreResult<Option<Arc<NodeObject>>> {
        self.fetch_total.fetch_add(1, Ordering::Relaxed);
        if let Some(obj) = self.cache.fetch(hash) {
            self.fetch_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(obj));
        }
        match self.backend.fetch(hash)? {
            Some(obj) => {
                self.fetch_hits.fetch_add(1, Ordering::Relaxed);
                trace!(hash = %hash.short_hex(), backend = self.backend.name(), "node fetched");
                Ok(Some(self.cache.canonicalize(*hash, Arc::new(obj))))
            }
            None => {
                trace!(hash = %hash.short_hex(), "node not in store");
                Ok(None)
            }
        }
    }

    /// Durably store one object.
    pub fn store(&self, kind: NodeObjectType, hash: Hash256, data: Bytes) -> NodeStoreResult<()> {
        self.store_object(NodeObject::new(kind, hash, data))
    }

    /// Durably store one already-built object.
    pub fn store_object(&self, object: NodeObject) -> NodeStoreResult<()> {
        self.backend.store(&object)?;
        self.record_stores(std::slice::from_ref(&object));
        self.cache.canonicalize_replace_cache(object.hash, Arc::new(object));
        Ok(())
    }

    /// Durably store a batch of objects in as few backend commits as the
    /// backend allows.
    pub fn store_batch(&self, batch: Vec<NodeObject>) -> NodeStoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.backend.store_batch(&batch)?;
        self.record_stores(&batch);
        debug!(count = batch.len(), backend = self.backend.name(), "stored node batch");
        for object in batch {
            self.cache.canonicalize_replace_cache(object.hash, Arc::new(object));
        }
        Ok(())
    }

    /// Check whether an object is available without decoding it.
    pub fn exists(&self, hash: &Hash256) -> NodeStoreResult<bool> {
        if self.cache.contains(hash) {
            return Ok(true);
        }
        self.backend.exists(hash)
    }

    /// Call `f` for every object in the backend.
    ///
    /// Must not run concurrently with writers.
    pub fn visit_all(&self, f: &mut dyn FnMut(NodeObject)) -> NodeStoreResult<()> {
        self.backend.for_each(f)
    }

    /// Copy every object of `source` into this database. Returns the number
    /// of objects copied.
    pub fn import(&self, source: &NodeDatabase) -> NodeStoreResult<usize> {
        let mut pending = Vec::with_capacity(IMPORT_BATCH);
        let mut copied = 0usize;
        let mut failure = None;
        source.visit_all(&mut |obj| {
            if failure.is_some() {
                return;
            }
            pending.push(obj);
            if pending.len() >= IMPORT_BATCH {
                copied += pending.len();
                if let Err(e) = self.backend.store_batch(&pending) {
                    failure = Some(e);
                }
                pending.clear();
            }
        })?;
        if let Some(e) = failure {
            return Err(e);
        }
        copied += pending.len();
        self.backend.store_batch(&pending)?;
        debug!(
            copied,
            from = source.backend_name(),
            to = self.backend_name(),
            "node store import complete"
        );
        Ok(copied)
    }

    /// Evict idle cached objects.
    pub fn sweep(&self) -> usize {
        self.cache.sweep()
    }

    pub fn stats(&self) -> NodeStoreStats {
        NodeStoreStats {
            fetch_total: self.fetch_total.load(Ordering::Relaxed),
            fetch_hits: self.fetch_hits.load(Ordering::Relaxed),
            store_count: self.store_count.load(Ordering::Relaxed),
            store_bytes: self.store_bytes.load(Ordering::Relaxed),
            cache_size: self.cache.len(),
        }
    }

    fn record_stores(&self, batch: &[NodeObject]) {
        let bytes: usize = batch.iter().map(NodeObject::size).sum();
        self.store_count.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.store_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for NodeDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDatabase")
            .field("backend", &self.backend.name())
            .field("cache", &self.cache)
            .finish()
    }
}
