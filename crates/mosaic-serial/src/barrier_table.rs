//! Barrier table emission: producer/consumer counts from the concrete
//! subtask expansion of each attached op.

use mosaic_core::prelude::*;
use mosaic_scheduler::BarrierSchedule;

use crate::dma::dma_task_count;
use crate::task::BarrierEntry;

const PASS: &str = "serialise-barriers";

/// How many concrete subtasks one op expands into at emission time.
///
/// DPU: workloads x clusters under a split strategy, workloads0 x clusters
/// under Clustering. DMA: 1 or cluster count, times {1,2,3} for sparsity
/// companions, minus empty sparse payloads. Software and implicit ops
/// count one.
pub fn count_producer_consumer_tasks(
    model: &ComputationModel,
    config: &GlobalConfig,
    op: OpId,
    trim_empty_tensors: bool,
) -> Result<u32> {
    let desc = model.op(op);
    let n = config.number_of_clusters;

    let count: i64 = match &desc.kind {
        OpKind::DpuTask { .. } => {
            let strategy = desc.split_strategy.unwrap_or(SplitStrategy::Clustering);
            if strategy != SplitStrategy::Clustering {
                let mut total = 0i64;
                for cluster in 0..n as usize {
                    match desc.workloads.get(cluster) {
                        Some(list) if !list.is_empty() => total += list.len() as i64,
                        _ => total += 1,
                    }
                }
                total
            } else {
                let per_cluster = desc
                    .workloads
                    .first()
                    .map(|l| l.len().max(1))
                    .unwrap_or(1) as i64;
                per_cluster * n as i64
            }
        }
        OpKind::DmaTask { .. } => {
            let input = model.tensor(desc.inputs[0]);
            let multiplicator: i64 = if input.populated && input.is_sparse() {
                2
            } else if input.is_sparse() {
                3
            } else {
                1
            };

            let base = dma_task_count(model, config, op)? as i64;

            // Empty sparse payloads are not emitted; the hardware would
            // halt on a zero-length transfer.
            let mut empty_tensors = 0i64;
            if trim_empty_tensors && input.populated && input.is_sparse() {
                if input.has_subtensors() && !input.is_broadcasted() {
                    for sub in &input.subtensors {
                        if sub.byte_size(input.dtype) == 0 {
                            empty_tensors += 1;
                        }
                    }
                } else if input.packed_byte_size() == 0 {
                    empty_tensors += 1;
                }
            }

            base * multiplicator - empty_tensors
        }
        OpKind::UpaTask { .. } | OpKind::Implicit(_) => 1,
        _ => 0,
    };

    if count < 0 {
        return Err(Error::logic(
            PASS,
            format!("sub-zero barrier count for '{}'", desc.name),
        ));
    }
    Ok(count as u32)
}

/// Build the table entries in barrier-index order.
pub fn build_barrier_table(
    model: &ComputationModel,
    config: &GlobalConfig,
    schedule: &BarrierSchedule,
) -> Result<Vec<BarrierEntry>> {
    let mut entries = Vec::with_capacity(schedule.len());
    for (i, barrier) in schedule.barriers.iter().enumerate() {
        let mut producer_count = 0;
        for &op in &schedule.producers[i] {
            producer_count += count_producer_consumer_tasks(model, config, op, true)?;
        }
        let mut consumer_count = 0;
        for &op in &schedule.consumers[i] {
            consumer_count += count_producer_consumer_tasks(model, config, op, true)?;
        }
        entries.push(BarrierEntry {
            id: barrier.index,
            real_id: barrier.real_index.unwrap_or(u32::MAX),
            producer_count,
            consumer_count,
        });
    }
    Ok(entries)
}
