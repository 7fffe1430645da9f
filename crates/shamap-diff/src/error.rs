//! Error types for the diff crate.

use shamap::ShaMapError;

/// Errors that can occur while comparing maps.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// A node of either map could not be loaded or decoded.
    #[error("map error: {0}")]
    ShaMap(#[from] ShaMapError),

    /// The maps differ in more items than the caller allowed.
    #[error("more than {limit} differences")]
    TooManyDifferences { limit: usize },
}

/// Convenience alias for diff results.
pub type DiffResult<T> = Result<T, DiffError>;
