//! Runtime serialisation: lower the scheduled graph to the flat container,
//! resolving tensor references, addresses, locale indices, and barrier
//! counts bit-exactly. Identical inputs produce identical bytes.

pub mod barrier_table;
pub mod blob;
pub mod codec;
pub mod dma;
pub mod dpu;
pub mod task;
pub mod tensor_ref;
pub mod wire;

pub use blob::{Blob, Header, Resources};
pub use codec::{Codec, COMPRESSION_THRESHOLD};
pub use task::{Task, TaskBody};
pub use tensor_ref::{Locale, TensorReference};

use mosaic_core::prelude::*;
use mosaic_scheduler::BarrierSchedule;

use blob::{BinaryEntry, FLAG_HUFFMAN, FLAG_PAD_OUTPUT, FLAG_STATIC_BARRIERS};

/// Run the target codec over every populated tensor worth compressing:
/// larger than the threshold, not FP16, and carrying payload bytes. Records
/// `compressed_size` and swaps the payload for the packed stream.
pub fn compress_populated_tensors(
    model: &mut ComputationModel,
    config: &GlobalConfig,
) -> Result<()> {
    if !config.huffman_compression {
        return Ok(());
    }
    for tid in model.tensor_ids().collect::<Vec<_>>() {
        let tensor = model.tensor(tid);
        if !tensor.populated
            || tensor.dtype == DType::Fp16
            || tensor.byte_size() <= COMPRESSION_THRESHOLD
            || tensor.compressed_size.is_some()
        {
            continue;
        }
        let data = match &tensor.data {
            Some(d) => d.clone(),
            None => continue,
        };
        let packed = codec::compress(Codec::Hde, &data)?;
        if packed.len() < data.len() {
            let tensor = model.tensor_mut(tid);
            tensor.compressed_size = Some(packed.len() as u64);
            tensor.data = Some(packed);
        }
    }
    Ok(())
}

/// Assign binary-section slots to populated tensors in arena order.
pub fn assign_graphfile_indices(model: &mut ComputationModel) {
    let mut next = 0u32;
    for tid in model.tensor_ids().collect::<Vec<_>>() {
        let tensor = model.tensor(tid);
        if tensor.populated && tensor.data.is_some() && tensor.graphfile_index.is_none() {
            model.tensor_mut(tid).graphfile_index = Some(next);
            next += 1;
        }
    }
}

/// Build the container from the scheduled model.
///
/// `order` is the schedule emission order over executable ops.
pub fn build_blob(
    model: &ComputationModel,
    order: &[OpId],
    barriers: &BarrierSchedule,
    config: &GlobalConfig,
    target: &TargetDescriptor,
) -> Result<Blob> {
    let mut flags = 0u32;
    if config.pad_output {
        flags |= FLAG_PAD_OUTPUT;
    }
    if config.huffman_compression {
        flags |= FLAG_HUFFMAN;
    }
    if config.enable_static_barriers {
        flags |= FLAG_STATIC_BARRIERS;
    }

    let mut net_inputs = Vec::new();
    for op in model.input_ops() {
        for &t in &model.op(op).outputs {
            net_inputs.push(TensorReference::build(model.tensor(t)));
        }
    }
    let mut net_outputs = Vec::new();
    for op in model.output_ops() {
        for &t in &model.op(op).inputs {
            net_outputs.push(TensorReference::build(model.tensor(t)));
        }
    }

    let mut compute_tasks = Vec::new();
    let mut dma_tasks = Vec::new();
    let mut port: u8 = 0;
    for &op in order {
        match model.op(op).kind {
            OpKind::DpuTask { .. } => {
                compute_tasks.extend(dpu::build_dpu_tasks(model, config, op)?);
            }
            OpKind::UpaTask { .. } => {
                compute_tasks.push(build_upa_task(model, op));
            }
            OpKind::DmaTask { .. } => {
                dma_tasks.extend(dma::build_dma_tasks(model, config, op, &mut port)?);
            }
            _ => {}
        }
    }

    let barrier_entries = barrier_table::build_barrier_table(model, config, barriers)?;
    let barrier_tasks = barrier_entries
        .iter()
        .map(|&entry| Task {
            name: format!("barrier_{}", entry.id),
            wait_barriers: Vec::new(),
            update_barriers: Vec::new(),
            body: TaskBody::BarrierConfig(entry),
        })
        .collect();

    let mut packed: Vec<(u32, BinaryEntry)> = Vec::new();
    for tid in model.tensor_ids() {
        let tensor = model.tensor(tid);
        if let (true, Some(index), Some(data)) =
            (tensor.populated, tensor.graphfile_index, &tensor.data)
        {
            packed.push((index, BinaryEntry::from_bytes(tensor.name.clone(), data)));
        }
    }
    packed.sort_by_key(|(index, _)| *index);
    let binary_data = packed.into_iter().map(|(_, entry)| entry).collect();

    Ok(Blob {
        header: Header {
            version: (blob::VERSION_MAJOR, blob::VERSION_MINOR, blob::VERSION_PATCH),
            device: target.device,
            revision: target.revision,
            flags,
            resources: Resources {
                clusters: config.number_of_clusters,
                dpus: config.number_of_dpus,
                cmx_bytes: config.cmx_bytes,
                ddr_scratch_bytes: config.ddr_scratch_bytes,
                memory_bandwidth: config.memory_bandwidth,
                system_clock_mhz: config.system_clock_mhz,
            },
            net_inputs,
            net_outputs,
        },
        compute_tasks,
        dma_tasks,
        barrier_tasks,
        barrier_table: barrier_entries,
        binary_data,
        weight_alignment: target.weight_alignment,
    })
}

/// Full serialisation to bytes.
pub fn serialize(
    model: &ComputationModel,
    order: &[OpId],
    barriers: &BarrierSchedule,
    config: &GlobalConfig,
    target: &TargetDescriptor,
) -> Result<Vec<u8>> {
    let blob = build_blob(model, order, barriers, config, target)?;
    let bytes = blob.emit();

    #[cfg(feature = "tracing")]
    tracing::debug!(
        bytes = bytes.len(),
        tasks = blob.compute_tasks.len() + blob.dma_tasks.len(),
        barriers = blob.barrier_table.len(),
        "emitted container"
    );
    Ok(bytes)
}

fn build_upa_task(model: &ComputationModel, op: OpId) -> Task {
    let desc = model.op(op);
    let kernel_name = match &desc.kind {
        OpKind::UpaTask { kernel_name } => kernel_name.clone(),
        _ => String::new(),
    };
    Task {
        name: desc.name.clone(),
        wait_barriers: desc.wait_barriers.iter().map(|b| b.get()).collect(),
        update_barriers: desc.update_barriers.iter().map(|b| b.get()).collect(),
        body: TaskBody::Upa(task::UpaTask {
            kernel_name,
            inputs: desc
                .inputs
                .iter()
                .map(|&t| TensorReference::build(model.tensor(t)))
                .collect(),
            outputs: desc
                .outputs
                .iter()
                .map(|&t| TensorReference::build(model.tensor(t)))
                .collect(),
        }),
    }
}
