//! Barrier insertion over the emitted schedule.
//!
//! Every scheduled task with downstream consumers gets one barrier: the
//! producer updates it, each executable consumer waits on it. Virtual
//! barriers number monotonically in schedule order; static mode reuses the
//! physical pool round-robin. Producer/consumer counts stay zero here and
//! are filled by the serialiser from the cluster/workload expansion.

use serde::{Deserialize, Serialize};

use mosaic_core::barrier::Barrier;
use mosaic_core::prelude::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BarrierSchedule {
    pub barriers: Vec<Barrier>,
    /// Ops updating each barrier, parallel to `barriers`.
    pub producers: Vec<Vec<OpId>>,
    /// Ops waiting on each barrier.
    pub consumers: Vec<Vec<OpId>>,
}

impl BarrierSchedule {
    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }
}

/// Attach wait/update barrier sets to the scheduled ops.
///
/// `order` is the schedule emission order over ops that exist in the model
/// (spills already materialised as DMA tasks).
pub fn insert_barriers(
    model: &mut ComputationModel,
    order: &[OpId],
    enable_static: bool,
) -> Result<BarrierSchedule> {
    let mut schedule = BarrierSchedule::default();

    for &producer in order {
        let consumers: Vec<OpId> = model
            .children(producer)
            .into_iter()
            .filter(|&c| model.op(c).is_executable())
            .collect();
        if consumers.is_empty() {
            continue;
        }

        let index = schedule.barriers.len() as u32;
        let barrier = if enable_static {
            Barrier::with_static_index(index)
        } else {
            Barrier::new(index)
        };
        let barrier_id = BarrierId::new(index);

        model.op_mut(producer).update_barriers.insert(barrier_id);
        for &consumer in &consumers {
            model.op_mut(consumer).wait_barriers.insert(barrier_id);
        }

        schedule.barriers.push(barrier);
        schedule.producers.push(vec![producer]);
        schedule.consumers.push(consumers);
    }

    Ok(schedule)
}
