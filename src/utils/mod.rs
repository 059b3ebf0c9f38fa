//! Shared utilities: bit sets and small graph algorithms.

mod bitset;
mod graph;

pub use bitset::BitSet;
pub use graph::{Dominators, FlowGraph};
