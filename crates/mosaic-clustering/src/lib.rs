//! Subtensor splitting: materialise per-cluster views of every tensor whose
//! producer or consumer demands them, and patch up strategy mismatches that
//! appear once spilling DMAs are in the graph.

pub mod compat;
pub mod split;

pub use compat::{consecutive_dma_workaround, ensure_split_strategies};
pub use split::generate_subtensors;
