//! Hashing primitives for the SHAMap ledger store.
//!
//! Every node hash is a BLAKE3 digest over a four-byte [`HashPrefix`]
//! followed by the node's canonical content. The prefix keeps inner nodes,
//! state leaves and transaction leaves in disjoint hash domains.

pub mod hasher;

pub use hasher::{ContentHasher, HashPrefix};
