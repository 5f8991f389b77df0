//! Workload generation: tile a DPU output into rectangles aligned to an MPE
//! mode, and estimate what the tiling costs to execute.
//!
//! The rectangle heuristic is the primary (and only) partitioner; when no
//! candidate mode yields a usable slicing it reports failure and the caller
//! falls back to a clustering strategy, one workload covering the whole
//! shape.

pub mod cost;
pub mod rect;
pub mod workloads;

pub use cost::{aggregate_cycles, greedy_task_assignment, workload_cycles, CostFunction};
pub use rect::{DpuMode, SplitMode};
pub use workloads::{split_pool, Workloads};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkloadError>;

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("tensor '{0}' cannot be sliced with the requested constraints")]
    CannotSlice(String),

    #[error("tensor '{tensor}' has invalid partition shape: W={w}, H={h}")]
    InvalidShape { tensor: String, w: u64, h: u64 },

    #[error("invalid workload argument: {0}")]
    Argument(String),
}

impl From<WorkloadError> for mosaic_core::Error {
    fn from(e: WorkloadError) -> Self {
        match e {
            WorkloadError::Argument(reason) => mosaic_core::Error::argument("workloads", reason),
            other => mosaic_core::Error::runtime("workloads", other.to_string()),
        }
    }
}
