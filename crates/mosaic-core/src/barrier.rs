//! Hardware barrier objects.
//!
//! Tasks carry wait/update sets of barrier indices; the producer and
//! consumer counts are filled at emission time from the cluster/workload
//! expansion of the attached tasks.

use serde::{Deserialize, Serialize};

/// Number of physical barriers available when static allocation is on.
pub const PHYSICAL_BARRIER_COUNT: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barrier {
    /// Stable virtual index; also the sort key of the barrier table.
    pub index: u32,
    /// Physical index when static barriers are enabled.
    pub real_index: Option<u32>,
    pub producer_count: u32,
    pub consumer_count: u32,
}

impl Barrier {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            real_index: None,
            producer_count: 0,
            consumer_count: 0,
        }
    }

    /// Round-robin assignment over the physical pool.
    pub fn with_static_index(index: u32) -> Self {
        Self {
            index,
            real_index: Some(index % PHYSICAL_BARRIER_COUNT),
            producer_count: 0,
            consumer_count: 0,
        }
    }

    /// Index the runtime should program.
    pub fn emitted_index(&self) -> u32 {
        self.real_index.unwrap_or(self.index)
    }
}
