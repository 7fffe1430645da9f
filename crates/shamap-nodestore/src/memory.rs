use std::collections::HashMap;

use parking_lot::RwLock;
use shamap_types::Hash256;

use crate::error::NodeStoreResult;
use crate::object::NodeObject;
use crate::traits::Backend;

/// In-memory, HashMap-based backend.
///
/// Intended for tests, transaction-set maps and embedding. All objects are
/// held behind a `RwLock`; `NodeObject` payloads are reference counted, so
/// reads are cheap clones.
pub struct MemoryBackend {
    objects: RwLock<HashMap<Hash256, NodeObject>>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns `true` if the backend is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Total payload bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.objects.read().values().map(|obj| obj.size() as u64).sum()
    }

    /// Remove one object. Only used to simulate partially available stores.
    pub fn remove(&self, hash: &Hash256) -> bool {
        self.objects.write().remove(hash).is_some()
    }

    /// Remove all objects.
    pub fn clear(&self) {
        self.objects.write().clear();
    }

    /// Sorted list of all stored hashes.
    pub fn all_hashes(&self) -> Vec<Hash256> {
        let mut hashes: Vec<Hash256> = self.objects.read().keys().copied().collect();
        hashes.sort();
        hashes
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn fetch(&self, hash: &Hash256) -> NodeStoreResult<Option<NodeObject>> {
        Ok(self.objects.read().get(hash).cloned())
    }

    fn store(&self, object: &NodeObject) -> NodeStoreResult<()> {
        // Same hash always means same content, so an existing entry is kept.
        self.objects
            .write()
            .entry(object.hash)
            .or_insert_with(|| object.clone());
        Ok(())
    }

    fn store_batch(&self, batch: &[NodeObject]) -> NodeStoreResult<()> {
        let mut map = self.objects.write();
        for object in batch {
            map.entry(object.hash).or_insert_with(|| object.clone());
        }
        Ok(())
    }

    fn exists(&self, hash: &Hash256) -> NodeStoreResult<bool> {
        Ok(self.objects.read().contains_key(hash))
    }

    fn for_each(&self, f: &mut dyn FnMut(NodeObject)) -> NodeStoreResult<()> {
        // Snapshot first so the callback may call back into the backend.
        let objects: Vec<NodeObject> = self.objects.read().values().cloned().collect();
        objects.into_iter().for_each(f);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("object_count", &self.len())
            .finish()
    }
}
