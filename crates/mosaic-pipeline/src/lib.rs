//! The pass driver: strategy selection, DMA insertion, subtensor
//! splitting, workload generation, feasible scheduling, and serialisation,
//! run in order over one computation model.

pub mod compile;
pub mod passes;
pub mod session;

pub use compile::{compile, CompileOutput, RunSummary};
pub use session::Session;
