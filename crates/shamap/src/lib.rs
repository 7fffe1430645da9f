//! The SHAMap: a copy-on-write, hash-addressed Merkle trie.
//!
//! A map stores items under 256-bit keys in a 16-way trie. Every node has a
//! content hash, so two maps with the same items have the same root hash,
//! and any subtree can be identified and fetched by hash alone.
//!
//! # Key Types
//!
//! - [`ShaMap`] -- The trie: reads, writes, snapshots, persistence
//! - [`TreeNode`] / [`InnerNode`] / [`LeafNode`] -- Nodes and their wire format
//! - [`NodeId`] -- Position of a node in the trie
//! - [`Family`] -- Node store and tree-node cache shared by a set of maps
//! - [`SyncFilter`] -- Extra node source consulted during acquisition

pub mod error;
pub mod family;
pub mod filter;
pub mod item;
pub mod iter;
pub mod map;
pub mod node;
pub mod node_id;

pub use error::{ShaMapError, ShaMapResult};
pub use family::{Family, FamilyConfig, TreeNodeCache};
pub use filter::SyncFilter;
pub use item::ShaMapItem;
pub use iter::Iter;
pub use map::{MapState, MapType, ShaMap};
pub use node::{InnerNode, LeafKind, LeafNode, TreeNode, BRANCH_FACTOR};
pub use node_id::{NodeId, LEAF_DEPTH};
