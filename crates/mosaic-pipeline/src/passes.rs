//! Adaptation passes between strategy selection and scheduling: explicit
//! DMA insertion, DPU workload generation, output padding, and spill
//! materialisation after the schedule exists.

use std::collections::HashMap;

use mosaic_core::prelude::*;
use mosaic_core::shape::IO_CHANNEL;
use mosaic_scheduler::{ScheduledKind, ScheduledOp};
use mosaic_workloads::{split_pool, CostFunction, DpuMode, SplitMode, Workloads};

use crate::session::Session;

const PASS: &str = "dma-insertion";

/// Give every DPU op CMX-resident operands: weights and activations that
/// live in DRAM get a load DMA, spilled outputs get a store DMA. Populated
/// inputs are promoted to CSRAM while the configured budget lasts.
pub fn insert_dma_tasks(model: &mut ComputationModel, session: &Session) -> Result<()> {
    let mut csram_left = session.config.csram_limit;

    for op in model.op_ids().collect::<Vec<_>>() {
        if !model.op(op).is_hardwarisable() {
            continue;
        }
        let op_strategy = model.op(op).split_strategy;

        // Inputs first: one load DMA per DRAM-resident operand.
        for slot in 0..model.op(op).inputs.len() {
            let tid = model.op(op).inputs[slot];
            let tensor = model.tensor(tid);
            if tensor.location == MemoryLocation::NnCmx {
                continue;
            }

            if tensor.populated
                && tensor.location == MemoryLocation::GraphFile
                && tensor.packed_byte_size() <= csram_left
            {
                csram_left -= tensor.packed_byte_size();
                model.tensor_mut(tid).location = MemoryLocation::Csram;
            }
            let tensor = model.tensor(tid);

            let strategy = operand_strategy(tensor, op_strategy);
            let direction = if tensor.location == MemoryLocation::Csram {
                DmaDirection::CsramToCmx
            } else {
                DmaDirection::DdrToCmx
            };

            let mut cmx = TensorDesc::new(
                session.unique_name(&format!("{}_cmx", tensor.name)),
                tensor.shape,
                tensor.dtype,
            );
            cmx.order = tensor.order;
            cmx.quant = tensor.quant.clone();
            cmx.populated = tensor.populated;
            cmx.location = MemoryLocation::NnCmx;
            cmx.strategy = Some(strategy);
            cmx.sparsity = tensor.sparsity;
            let cmx_id = model.add_tensor(cmx);

            if model.tensor(tid).strategy.is_none() {
                model.tensor_mut(tid).strategy = Some(strategy);
            }

            let mut dma = OpDesc::new(
                session.unique_name(&format!("dma_in_{}", model.op(op).name)),
                OpKind::DmaTask { direction },
            );
            dma.inputs.push(tid);
            dma.outputs.push(cmx_id);
            model.add_op(dma);

            model.op_mut(op).inputs[slot] = cmx_id;
        }

        // The DPU writes its scratchpad; a spilled output leaves through a
        // store DMA.
        for slot in 0..model.op(op).outputs.len() {
            let tid = model.op(op).outputs[slot];
            let tensor = model.tensor(tid);
            if tensor.location == MemoryLocation::NnCmx {
                continue;
            }

            let strategy = model
                .tensor(tid)
                .strategy
                .or(op_strategy)
                .unwrap_or(SplitStrategy::Clustering);

            let mut cmx = TensorDesc::new(
                session.unique_name(&format!("{}_cmx", tensor.name)),
                tensor.shape,
                tensor.dtype,
            );
            cmx.order = tensor.order;
            cmx.quant = tensor.quant.clone();
            cmx.location = MemoryLocation::NnCmx;
            cmx.strategy = Some(strategy);
            let cmx_id = model.add_tensor(cmx);

            if model.tensor(tid).strategy.is_none() {
                model.tensor_mut(tid).strategy = Some(strategy);
            }

            let mut dma = OpDesc::new(
                session.unique_name(&format!("dma_out_{}", model.op(op).name)),
                OpKind::DmaTask {
                    direction: DmaDirection::CmxToDdr,
                },
            );
            dma.inputs.push(cmx_id);
            dma.outputs.push(tid);

            // Rewire: the op now produces the CMX tensor; the DMA feeds the
            // original DRAM tensor and inherits its consumers.
            model.rebind_output(op, tid, cmx_id);
            model.add_op(dma);
        }
    }
    Ok(())
}

/// Weights follow the consumer's channel split; activations follow its
/// spatial split. A channel-split op still reads its full input on every
/// cluster, so its activation broadcasts.
fn operand_strategy(tensor: &TensorDesc, op_strategy: Option<SplitStrategy>) -> SplitStrategy {
    match (tensor.populated, op_strategy) {
        (true, Some(SplitStrategy::SplitOverK)) => SplitStrategy::SplitOverK,
        (true, _) => SplitStrategy::Clustering,
        (false, Some(SplitStrategy::SplitOverK)) => SplitStrategy::Clustering,
        (false, Some(s)) => s,
        (false, None) => SplitStrategy::Clustering,
    }
}

/// Tile every DPU output into per-cluster workload lists.
pub fn generate_dpu_workloads(model: &mut ComputationModel, config: &GlobalConfig) -> Result<()> {
    let n_dpu = config.dpus_per_cluster() as usize;
    let clusters = config.number_of_clusters as usize;
    let mode_list = [DpuMode::new(4, 4), DpuMode::new(1, 16)];

    for op in model.op_ids().collect::<Vec<_>>() {
        if !model.op(op).is_hardwarisable() {
            continue;
        }
        let out = match model.op(op).outputs.first().copied() {
            Some(t) => t,
            None => continue,
        };
        let strategy = model
            .op(op)
            .split_strategy
            .unwrap_or(SplitStrategy::Clustering);
        let split = strategy != SplitStrategy::Clustering && clusters > 1;
        let cluster_count = if split { clusters } else { 1 };

        let mut per_cluster = Vec::with_capacity(cluster_count);
        for cluster in 0..cluster_count {
            let shape = if split {
                model
                    .tensor(out)
                    .subtensors
                    .get(cluster)
                    .map(|s| s.shape)
                    .unwrap_or(model.tensor(out).shape)
            } else {
                model.tensor(out).shape
            };

            let mut workloads = Workloads::new(model.op(op).name.clone(), shape);
            let pool = split_pool(&shape, n_dpu, &[mode_list.to_vec()], 50);
            let preferred = pool
                .iter()
                .copied()
                .filter(|&c| c <= n_dpu)
                .max()
                .unwrap_or(1);

            let generated = workloads
                .partition_rectangle_heuristic(
                    &mode_list,
                    preferred as u64,
                    true,
                    true,
                    false,
                    SplitMode::Hw,
                )
                .is_ok()
                && workloads.validate(&shape);

            if !generated {
                // Clustering fallback: one workload covering the shape.
                workloads = Workloads::new(model.op(op).name.clone(), shape);
                let mut whole = Workload::new(MpeMode::Matrix);
                whole.max_x = shape.width() as i64 - 1;
                whole.max_y = shape.height() as i64 - 1;
                whole.max_z = shape.channels().max(1) as i64 - 1;
                workloads.add(whole);
            }
            workloads.generate_execution_cycles(n_dpu, CostFunction::Balanced)?;
            per_cluster.push(workloads.into_workloads());
        }
        model.op_mut(op).workloads = per_cluster;
    }
    Ok(())
}

/// Channel-pad the network output to the configured alignment.
pub fn pad_network_output(model: &mut ComputationModel, config: &GlobalConfig) {
    if !config.pad_output {
        return;
    }
    let granularity = config.channel_padding as u64;
    for op in model.output_ops() {
        for tid in model.op(op).inputs.clone() {
            let tensor = model.tensor_mut(tid);
            let c = tensor.shape.get(IO_CHANNEL);
            let padded = (c + granularity - 1) / granularity * granularity;
            if padded != c {
                tensor.shape.set(IO_CHANNEL, padded);
            }
        }
    }
}

/// Lower the schedule to model ops: bind scratchpad addresses, synthesise
/// spill DMA ops, and rewire consumers past each spill. Returns the final
/// emission order.
pub fn materialize_spills(
    model: &mut ComputationModel,
    session: &Session,
    schedule: &[ScheduledOp],
) -> Result<Vec<OpId>> {
    let mut order = Vec::with_capacity(schedule.len());
    let mut spill_ddr: HashMap<OpId, TensorId> = HashMap::new();

    for (position, entry) in schedule.iter().enumerate() {
        match entry.kind {
            ScheduledKind::Original => {
                if let Some((begin, _)) = entry.interval {
                    bind_addresses(model, entry.op, begin);
                }
                order.push(entry.op);
            }
            ScheduledKind::SpillWrite => {
                let src = output_tensor(model, entry.op)?;
                let src_desc = model.tensor(src);
                let mut ddr = TensorDesc::new(
                    session.unique_name(&format!("{}_spilled", src_desc.name)),
                    src_desc.shape,
                    src_desc.dtype,
                );
                ddr.order = src_desc.order;
                ddr.quant = src_desc.quant.clone();
                ddr.location = MemoryLocation::DdrHeap;
                ddr.strategy = src_desc.strategy;
                let ddr_id = model.add_tensor(ddr);
                spill_ddr.insert(entry.op, ddr_id);

                let mut dma = OpDesc::new(
                    session.unique_name(&format!("spill_write_{}", model.op(entry.op).name)),
                    OpKind::DmaTask {
                        direction: DmaDirection::CmxToDdr,
                    },
                );
                dma.inputs.push(src);
                dma.outputs.push(ddr_id);
                let dma_id = model.add_op(dma);
                order.push(dma_id);
            }
            ScheduledKind::SpillRead => {
                let ddr_id = *spill_ddr.get(&entry.op).ok_or_else(|| {
                    Error::logic(
                        PASS,
                        format!(
                            "spill-read of '{}' without a prior spill-write",
                            model.op(entry.op).name
                        ),
                    )
                })?;
                let src = output_tensor(model, entry.op)?;
                let src_desc = model.tensor(src);
                let mut cmx = TensorDesc::new(
                    session.unique_name(&format!("{}_respill", src_desc.name)),
                    src_desc.shape,
                    src_desc.dtype,
                );
                cmx.order = src_desc.order;
                cmx.quant = src_desc.quant.clone();
                cmx.location = MemoryLocation::NnCmx;
                cmx.strategy = src_desc.strategy;
                if let Some((begin, _)) = entry.interval {
                    cmx.address = Some(begin);
                }
                let cmx_id = model.add_tensor(cmx);

                let mut dma = OpDesc::new(
                    session.unique_name(&format!("spill_read_{}", model.op(entry.op).name)),
                    OpKind::DmaTask {
                        direction: DmaDirection::DdrToCmx,
                    },
                );
                dma.inputs.push(ddr_id);
                dma.outputs.push(cmx_id);
                let dma_id = model.add_op(dma);
                order.push(dma_id);

                // Consumers scheduled after this read take the re-loaded
                // copy.
                rewire_later_consumers(model, schedule, position, entry.op, src, cmx_id);
            }
        }
    }
    Ok(order)
}

fn output_tensor(model: &ComputationModel, op: OpId) -> Result<TensorId> {
    model.op(op).outputs.first().copied().ok_or_else(|| {
        Error::logic(
            PASS,
            format!("op '{}' has no output to spill", model.op(op).name),
        )
    })
}

/// Assign the scheduler's interval base to the op's scratchpad output and
/// shift its subtensor addresses with it.
fn bind_addresses(model: &mut ComputationModel, op: OpId, base: u64) {
    for tid in model.op(op).outputs.clone() {
        let tensor = model.tensor_mut(tid);
        if tensor.location != MemoryLocation::NnCmx {
            continue;
        }
        tensor.address = Some(base);
        for sub in &mut tensor.subtensors {
            sub.address = Some(base + sub.address.unwrap_or(0));
        }
        for sub in &mut tensor.consumer_subtensors {
            sub.address = Some(base + sub.address.unwrap_or(0));
        }
    }
}

fn rewire_later_consumers(
    model: &mut ComputationModel,
    schedule: &[ScheduledOp],
    read_position: usize,
    producer: OpId,
    old: TensorId,
    new: TensorId,
) {
    for later in &schedule[read_position + 1..] {
        if later.kind != ScheduledKind::Original || later.op == producer {
            continue;
        }
        let inputs = &mut model.op_mut(later.op).inputs;
        for t in inputs.iter_mut() {
            if *t == old {
                *t = new;
            }
        }
    }
}
