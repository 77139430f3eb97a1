//! Shared utilities.
//!
//! - [`BitSet`] - word-packed register sets used by liveness and interference
//! - [`graph`] - depth-first orders and the weak topological order used by the fixpoint
//!   iterator

mod bitset;
pub mod graph;

pub use bitset::{BitSet, BitSetIter};
