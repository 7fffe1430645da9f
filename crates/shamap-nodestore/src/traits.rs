use shamap_types::Hash256;

use crate::error::NodeStoreResult;
use crate::object::NodeObject;

/// A durable hash → blob store.
///
/// All implementations must satisfy these invariants:
/// - Objects are immutable once written. The key is the content hash of the
///   tree node, so writing the same key twice always writes the same bytes.
/// - Concurrent reads are always safe, and concurrent writes never corrupt
///   unrelated keys.
/// - Once `store` or `store_batch` returns `Ok`, every object it was given
///   can be fetched.
/// - Failures are reported as errors carrying the backend's name. Nothing is
///   retried internally.
pub trait Backend: Send + Sync {
    /// Short, stable name of the engine (`"memory"`, `"redb"`, ...).
    fn name(&self) -> &str;

    /// Read an object by hash. `Ok(None)` if it is not stored.
    fn fetch(&self, hash: &Hash256) -> NodeStoreResult<Option<NodeObject>>;

    /// Write a single object.
    fn store(&self, object: &NodeObject) -> NodeStoreResult<()>;

    /// Write several objects.
    ///
    /// Default implementation calls `store()` for each object. Backends
    /// should override it to commit the whole batch at once.
    fn store_batch(&self, batch: &[NodeObject]) -> NodeStoreResult<()> {
        batch.iter().try_for_each(|obj| self.store(obj))
    }

    /// Read several objects.
    fn fetch_batch(&self, hashes: &[Hash256]) -> NodeStoreResult<Vec<Option<NodeObject>>> {
        hashes.iter().map(|h| self.fetch(h)).collect()
    }

    /// Check whether an object is stored.
    fn exists(&self, hash: &Hash256) -> NodeStoreResult<bool> {
        Ok(self.fetch(hash)?.is_some())
    }

    /// Call `f` for every stored object, in unspecified order.
    ///
    /// Intended for import, export and verification tooling. Callers must
    /// make sure no writer is active while the visit runs.
    fn for_each(&self, f: &mut dyn FnMut(NodeObject)) -> NodeStoreResult<()>;
}
