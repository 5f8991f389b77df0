//! Umbrella crate: re-exports the mosaic compiler stack for integration
//! tests and downstream embedders.
//!
//! The compilation core lowers a typed operator graph onto a multi-cluster
//! dataflow accelerator: strategy selection, per-cluster subtensor
//! splitting, workload generation, feasible memory scheduling with
//! spilling, and flat-binary serialisation.

pub use mosaic_clustering as clustering;
pub use mosaic_core as ir;
pub use mosaic_pipeline as pipeline;
pub use mosaic_scheduler as scheduler;
pub use mosaic_serial as serial;
pub use mosaic_strategy as strategy;
pub use mosaic_workloads as workloads;

pub use mosaic_core::{Error, Result};
pub use mosaic_pipeline::{compile, CompileOutput, RunSummary, Session};
