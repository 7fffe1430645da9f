//! In-memory caches shared by every map of a node.
//!
//! - [`TaggedCache`] maps a key (a content hash) to a shared `Arc<V>`. It
//!   de-duplicates identical objects through [`TaggedCache::canonicalize`]
//!   and evicts the least recently touched entries once over capacity.
//!   An entry whose `Arc` is still held outside the cache is *pinned* and is
//!   never evicted.
//! - [`KeyCache`] remembers bare keys with the same recency policy. It backs
//!   negative and "already complete" lookups that carry no payload.
//!
//! Both caches lock internally, so one instance can be handed by reference
//! to any number of threads.

pub mod key;
pub mod stats;
pub mod tagged;

pub use key::KeyCache;
pub use stats::CacheStats;
pub use tagged::TaggedCache;
