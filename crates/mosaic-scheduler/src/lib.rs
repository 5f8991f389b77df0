//! Resource-aware list scheduling.
//!
//! Orders task executions under a contiguous scratchpad budget, inserting
//! spill-write / spill-read operations when transient demand exceeds
//! capacity. The compiler is single-threaded; the multi-cluster target is
//! simulated deterministically here.

pub mod barriers;
pub mod dag;
pub mod feasible;
pub mod resource;

pub use barriers::{insert_barriers, BarrierSchedule};
pub use dag::DagAdapter;
pub use feasible::{FeasibleMemoryScheduler, ScheduledKind, ScheduledOp};
pub use resource::ProducerConsumerResource;
