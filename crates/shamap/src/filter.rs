use shamap_nodestore::NodeObjectType;
use shamap_types::Hash256;

/// An extra source of nodes consulted while a map is being acquired.
///
/// Sync code passes a filter to lookups that would otherwise report a node
/// as missing. Typical filters hold nodes received from peers that were not
/// written to the node store yet, and persist whatever they are told about.
pub trait SyncFilter {
    /// Wire bytes of the node with `hash`, if the filter has them.
    fn get_node(&self, hash: &Hash256) -> Option<Vec<u8>>;

    /// Called for every node a map accepted during sync. `from_filter` is
    /// `true` when the bytes came from [`get_node`](Self::get_node).
    fn got_node(&self, from_filter: bool, hash: &Hash256, data: &[u8], kind: NodeObjectType);
}
