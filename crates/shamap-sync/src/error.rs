use shamap::{NodeId, ShaMapError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("map error: {0}")]
    ShaMap(#[from] ShaMapError),

    #[error("node {0} is not in the map")]
    NodeNotFound(NodeId),
}

pub type SyncResult<T> = Result<T, SyncError>;
