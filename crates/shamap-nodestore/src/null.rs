use shamap_types::Hash256;

use crate::error::NodeStoreResult;
use crate::object::NodeObject;
use crate::traits::Backend;

/// A backend that stores nothing.
///
/// Every fetch misses and every write is discarded. Useful for nodes that
/// keep only the in-memory cache, and for measuring the tree layer without
/// storage cost.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl Backend for NullBackend {
    fn name(&self) -> &str {
        "none"
    }

    fn fetch(&self, _hash: &Hash256) -> NodeStoreResult<Option<NodeObject>> {
        Ok(None)
    }

    fn store(&self, _object: &NodeObject) -> NodeStoreResult<()> {
        Ok(())
    }

    fn store_batch(&self, _batch: &[NodeObject]) -> NodeStoreResult<()> {
        Ok(())
    }

    fn for_each(&self, _f: &mut dyn FnMut(NodeObject)) -> NodeStoreResult<()> {
        Ok(())
    }
}
