//! Foundation types for the SHAMap ledger store.
//!
//! Every other crate in the workspace depends on `shamap-types`. The one
//! type that matters is [`Hash256`]: it is used both as the content hash of
//! a tree node and as the key of a ledger item, so that a key can be walked
//! nibble by nibble down the trie.

pub mod error;
pub mod hash;

pub use error::TypeError;
pub use hash::Hash256;
