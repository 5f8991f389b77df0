//! DPU task emission: one invariant per cluster with its variant
//! (workload) list, or a single invariant under a broadcast strategy.

use mosaic_core::prelude::*;

use crate::task::{DpuTask, DpuVariant, Task, TaskBody};
use crate::tensor_ref::TensorReference;

const PASS: &str = "serialise-dpu";

pub fn build_dpu_tasks(
    model: &ComputationModel,
    config: &GlobalConfig,
    op: OpId,
) -> Result<Vec<Task>> {
    let desc = model.op(op);
    let (task_op, kernel) = match &desc.kind {
        OpKind::DpuTask { task_op, kernel } => (*task_op, *kernel),
        _ => {
            return Err(Error::op(PASS, desc.name.clone(), "not a DPU task"));
        }
    };

    let input_id = *desc.inputs.first().ok_or_else(|| {
        Error::op(PASS, desc.name.clone(), "DPU task without input tensor")
    })?;
    let output_id = *desc.outputs.first().ok_or_else(|| {
        Error::op(PASS, desc.name.clone(), "DPU task without output tensor")
    })?;
    let weights_id = desc
        .inputs
        .iter()
        .copied()
        .find(|&t| model.tensor(t).populated);

    let input = model.tensor(input_id);
    let output = model.tensor(output_id);
    let parent_input = TensorReference::build(input);
    let parent_output = TensorReference::build(output);

    let split = desc.split_strategy.unwrap_or(SplitStrategy::Clustering);
    let per_cluster = split != SplitStrategy::Clustering && config.number_of_clusters > 1;

    let mut tasks = Vec::new();
    if per_cluster {
        for cluster in 0..config.number_of_clusters as usize {
            let cluster_input = cluster_view(model, input_id, cluster)?;
            let cluster_output = cluster_view(model, output_id, cluster)?;
            let cluster_weights = match weights_id {
                Some(w) => Some(cluster_view(model, w, cluster)?),
                None => None,
            };
            tasks.push(Task {
                name: format!("{}_cluster{cluster}", desc.name),
                wait_barriers: desc.wait_barriers.iter().map(|b| b.get()).collect(),
                update_barriers: desc.update_barriers.iter().map(|b| b.get()).collect(),
                body: TaskBody::Dpu(DpuTask {
                    task_op,
                    kernel: kernel.kernel,
                    stride: kernel.stride,
                    pad: kernel.pad,
                    input: cluster_input,
                    parent_input: parent_input.clone(),
                    output: cluster_output,
                    parent_output: parent_output.clone(),
                    weights: cluster_weights,
                    variants: variants_for(desc, cluster),
                }),
            });
        }
    } else {
        let weights = match weights_id {
            Some(w) => Some(TensorReference::build(model.tensor(w))),
            None => None,
        };
        tasks.push(Task {
            name: desc.name.clone(),
            wait_barriers: desc.wait_barriers.iter().map(|b| b.get()).collect(),
            update_barriers: desc.update_barriers.iter().map(|b| b.get()).collect(),
            body: TaskBody::Dpu(DpuTask {
                task_op,
                kernel: kernel.kernel,
                stride: kernel.stride,
                pad: kernel.pad,
                input: parent_input.clone(),
                parent_input,
                output: parent_output.clone(),
                parent_output,
                weights,
                variants: variants_for(desc, 0),
            }),
        });
    }
    Ok(tasks)
}

fn cluster_view(
    model: &ComputationModel,
    tensor: TensorId,
    cluster: usize,
) -> Result<TensorReference> {
    let t = model.tensor(tensor);
    if !t.consumer_subtensors.is_empty() {
        // ClusteringAndSoh: the reader takes the height-split view set.
        TensorReference::build_for_cluster_consumer(t, cluster)
    } else if t.has_subtensors() {
        TensorReference::build_for_cluster(t, cluster)
    } else {
        Ok(TensorReference::build(t))
    }
}

fn variants_for(desc: &OpDesc, cluster: usize) -> Vec<DpuVariant> {
    let empty = Vec::new();
    let workloads = desc.workloads.get(cluster).unwrap_or(&empty);
    workloads
        .iter()
        .map(|w| DpuVariant {
            cluster: cluster as u32,
            mpe_mode: w.mpe_mode.wire_code(),
            min_x: w.min_x as i32,
            max_x: w.max_x as i32,
            min_y: w.min_y as i32,
            max_y: w.max_y as i32,
            min_z: w.min_z as i32,
            max_z: w.max_z as i32,
            padding: w.padding,
        })
        .collect()
}
