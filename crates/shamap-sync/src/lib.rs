//! Incremental acquisition of SHAMaps.
//!
//! A node that knows only the root hash of a map asks peers for the nodes
//! it lacks, a batch at a time, and attaches each one after checking it
//! against the hash its parent records. The serving side answers with
//! fat nodes and fetch packs. The network layer itself is not part of
//! this crate.

pub mod acquire;
pub mod error;
pub mod full_below;
pub mod outcome;
pub mod serve;

pub use acquire::{
    add_known_node, add_root_node, missing_nodes, needed_hashes, needed_node_hashes,
};
pub use error::{SyncError, SyncResult};
pub use full_below::FullBelowCache;
pub use outcome::AddNodeOutcome;
pub use serve::{fetch_pack, get_node_fat};
