use std::fmt::Display;

use shamap_types::Hash256;

/// Errors from node store operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeStoreError {
    /// The backend failed to read or write. Carries the backend's name so
    /// that a failure can be traced to a concrete engine.
    #[error("{backend} backend error: {message}")]
    Backend { backend: String, message: String },

    /// A stored blob could not be decoded.
    #[error("corrupt object {hash}: {reason}")]
    CorruptObject { hash: Hash256, reason: String },

    /// I/O error outside of a backend call (opening paths, compression).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration does not describe a usable store.
    #[error("configuration error: {0}")]
    Config(String),
}

impl NodeStoreError {
    /// Wrap any backend-specific error.
    pub fn backend(backend: &str, err: impl Display) -> Self {
        Self::Backend {
            backend: backend.to_string(),
            message: err.to_string(),
        }
    }
}

/// Result alias for node store operations.
pub type NodeStoreResult<T> = Result<T, NodeStoreError>;
