//! Durable hash → blob storage for SHAMap nodes.
//!
//! The store knows nothing about trees. It keeps opaque [`NodeObject`]s
//! keyed by the hash the tree layer computed for them, behind a pluggable
//! [`Backend`]:
//!
//! - [`MemoryBackend`]: a locked `HashMap`, for tests and transient maps.
//! - [`RedbBackend`]: an embedded B-tree file, optionally zstd-compressed.
//! - [`NullBackend`]: stores nothing and finds nothing.
//!
//! [`NodeDatabase`] sits in front of a backend and adds a cache of decoded
//! objects plus fetch/store counters. It is what a `Family` holds.

pub mod codec;
pub mod config;
pub mod database;
pub mod error;
pub mod memory;
pub mod null;
pub mod object;
pub mod redb_backend;
pub mod traits;

pub use codec::Compression;
pub use config::{make_backend, BackendKind, NodeStoreConfig};
pub use database::{NodeDatabase, NodeStoreStats};
pub use error::{NodeStoreError, NodeStoreResult};
pub use memory::MemoryBackend;
pub use null::NullBackend;
pub use object::{NodeObject, NodeObjectType};
pub use redb_backend::RedbBackend;
pub use traits::Backend;
