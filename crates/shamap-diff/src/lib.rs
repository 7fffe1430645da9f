//! Structural comparison of two SHAMaps.
//!
//! Both trees are walked in lockstep by node position. Wherever the two
//! maps record the same hash for a position the whole subtree is skipped
//! without being loaded, so the cost follows the size of the difference
//! rather than the size of either map.
//!
//! # Key Types
//!
//! - [`MapDiff`] / [`ItemChange`] -- Items added, removed and changed
//! - [`compare`] / [`compare_bounded`] -- Entry points

pub mod compare;
pub mod error;

pub use compare::{compare, compare_bounded, ItemChange, MapDiff};
pub use error::{DiffError, DiffResult};
