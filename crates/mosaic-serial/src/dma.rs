//! DMA task emission.
//!
//! One DMA op in the model becomes one task (broadcast source) or one task
//! per cluster (split source), plus the companion transfers of a sparse
//! input. Strategy-override tags left by the spilling fix-ups flip the
//! broadcast decision.

use mosaic_core::prelude::*;
use mosaic_core::tensor::OverwriteStrategy;

use crate::task::{DmaTask, Task, TaskBody};
use crate::tensor_ref::TensorReference;

const PASS: &str = "serialise-dma";

/// Does this DMA's source behave as a single whole copy (case 1) rather
/// than per-cluster slices (case 2)? Shared with barrier counting so both
/// agree on the task multiplicity.
pub fn dma_source_broadcast(model: &ComputationModel, op: OpId) -> Result<bool> {
    let desc = model.op(op);
    let direction = desc.dma_direction().ok_or_else(|| {
        Error::op(PASS, desc.name.clone(), "not a DMA task")
    })?;
    let input = model.tensor(desc.inputs[0]);
    let output = model.tensor(desc.outputs[0]);

    let mut broadcast = input.is_broadcasted();
    match direction {
        DmaDirection::DdrToCmx | DmaDirection::CsramToCmx => {
            if let Some(tag) = input.overwrite_strategy {
                broadcast = match tag {
                    OverwriteStrategy::ClusteringToSoH => false,
                    OverwriteStrategy::SoHToClustering => true,
                };
            } else if output.overwrite_strategy == Some(OverwriteStrategy::ClusteringToSoH) {
                // The destination was re-tagged broadcast by the spilling
                // fix-up; one DMA fans out to every cluster.
                broadcast = true;
            }
        }
        DmaDirection::CmxToDdr => {
            if let Some(tag) = output.overwrite_strategy {
                broadcast = match tag {
                    OverwriteStrategy::ClusteringToSoH => true,
                    OverwriteStrategy::SoHToClustering => false,
                };
            }
        }
        _ => {}
    }
    Ok(broadcast)
}

/// Emission multiplicity of one DMA op before sparsity companions.
pub fn dma_task_count(model: &ComputationModel, config: &GlobalConfig, op: OpId) -> Result<u32> {
    let n = config.number_of_clusters;
    if n <= 1 {
        return Ok(1);
    }
    let input = model.tensor(model.op(op).inputs[0]);
    let output = model.tensor(model.op(op).outputs[0]);
    if dma_source_broadcast(model, op)?
        || (splitting_of(input, output) == Some(SplitStrategy::SplitOverK)
            && !output.populated)
        || input.strategy == Some(SplitStrategy::Clustering)
    {
        Ok(1)
    } else {
        Ok(n)
    }
}

fn splitting_of(input: &TensorDesc, output: &TensorDesc) -> Option<SplitStrategy> {
    output.strategy.or(input.strategy)
}

/// Build the wire tasks for one DMA op.
pub fn build_dma_tasks(
    model: &ComputationModel,
    config: &GlobalConfig,
    op: OpId,
    port: &mut u8,
) -> Result<Vec<Task>> {
    let desc = model.op(op);
    let direction = desc.dma_direction().ok_or_else(|| {
        Error::op(PASS, desc.name.clone(), "not a DMA task")
    })?;
    let input_id = desc.inputs[0];
    let output_id = desc.outputs[0];
    let n = config.number_of_clusters;

    let single = dma_task_count(model, config, op)? == 1;

    let mut tasks = Vec::new();
    let mut pair = |tasks: &mut Vec<Task>,
                    model: &ComputationModel,
                    src_id: TensorId,
                    dst_id: TensorId,
                    port: &mut u8|
     -> Result<()> {
        let src_tensor = model.tensor(src_id);
        let dst_tensor = model.tensor(dst_id);
        let compression = src_tensor.compressed_size.is_some();
        if single {
            let src = TensorReference::build(src_tensor);
            let mut dst = TensorReference::build(dst_tensor);
            if matches!(
                direction,
                DmaDirection::DdrToCmx | DmaDirection::CsramToCmx
            ) {
                // The destination spans every cluster.
                dst.locale_index = (0..n).rev().collect();
            }
            tasks.push(make_task(
                desc,
                direction,
                src,
                dst,
                next_port(port, config),
                compression,
            ));
        } else {
            for cluster in 0..n as usize {
                let src = cluster_ref(src_tensor, cluster)?;
                let dst = cluster_ref(dst_tensor, cluster)?;
                tasks.push(make_task(
                    desc,
                    direction,
                    src,
                    dst,
                    next_port(port, config),
                    compression,
                ));
            }
        }
        Ok(())
    };

    pair(&mut tasks, model, input_id, output_id, port)?;

    // A sparse input also moves its sparsity map and, when unpopulated,
    // its storage-element table.
    let input = model.tensor(input_id);
    let output = model.tensor(output_id);
    if let (Some(in_sp), Some(out_sp)) = (input.sparsity, output.sparsity) {
        pair(
            &mut tasks,
            model,
            in_sp.sparsity_map,
            out_sp.sparsity_map,
            port,
        )?;
        if !input.populated {
            if let (Some(in_se), Some(out_se)) =
                (in_sp.storage_elements, out_sp.storage_elements)
            {
                pair(&mut tasks, model, in_se, out_se, port)?;
            }
        }
    }

    Ok(tasks)
}

fn cluster_ref(tensor: &TensorDesc, cluster: usize) -> Result<TensorReference> {
    if tensor.has_subtensors() {
        TensorReference::build_for_cluster(tensor, cluster)
    } else {
        Ok(TensorReference::build(tensor))
    }
}

fn make_task(
    desc: &OpDesc,
    direction: DmaDirection,
    src: TensorReference,
    dst: TensorReference,
    port: u8,
    compression: bool,
) -> Task {
    Task {
        name: desc.name.clone(),
        wait_barriers: desc.wait_barriers.iter().map(|b| b.get()).collect(),
        update_barriers: desc.update_barriers.iter().map(|b| b.get()).collect(),
        body: TaskBody::Dma(DmaTask {
            direction,
            src,
            dst,
            port,
            compression,
        }),
    }
}

fn next_port(port: &mut u8, config: &GlobalConfig) -> u8 {
    let assigned = *port;
    *port = (*port + 1) % config.dma_controllers.max(1) as u8;
    assigned
}
