//! Error types for map operations.

use shamap_nodestore::NodeStoreError;
use shamap_types::Hash256;

use crate::map::MapType;
use crate::node_id::NodeId;

/// Errors that can occur while reading, mutating or persisting a map.
#[derive(Debug, thiserror::Error)]
pub enum ShaMapError {
    /// Node bytes were malformed or did not hash to the expected value.
    #[error("corrupt node: {0}")]
    CorruptNode(String),

    /// A mutation was attempted on a map that is not modifiable.
    #[error("map is immutable")]
    ImmutableMap,

    /// A referenced node is neither cached nor stored locally.
    ///
    /// Carries enough to fetch the node from elsewhere and retry.
    #[error("missing {map_type} node {hash} at {node_id}")]
    MissingNode {
        map_type: MapType,
        hash: Hash256,
        node_id: NodeId,
    },

    /// The tree violates a structural invariant.
    #[error("invariant violated at {node_id}: {reason}")]
    Invariant { node_id: NodeId, reason: String },

    /// The node store failed.
    #[error("node store error: {0}")]
    Backend(#[from] NodeStoreError),
}

impl ShaMapError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptNode(reason.into())
    }

    /// Returns `true` for [`ShaMapError::MissingNode`].
    pub fn is_missing_node(&self) -> bool {
        matches!(self, Self::MissingNode { .. })
    }
}

/// Convenience alias for map results.
pub type ShaMapResult<T> = Result<T, ShaMapError>;
