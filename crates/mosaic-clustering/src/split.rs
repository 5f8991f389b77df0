//! Per-cluster subtensor generation.
//!
//! For every tensor whose producer or consumer demands cluster-local views,
//! materialise N subtensors implementing the tensor's current strategy:
//! offsets, shapes, addresses, locale indices, and (for sparse tensors) the
//! matching slices of the sparsity companions.

use once_cell::sync::Lazy;

use mosaic_core::prelude::*;
use mosaic_core::shape::{IO_CHANNEL, IO_HEIGHT, IO_WIDTH, KERNEL_OUTPUT_CHANNELS};
use mosaic_workloads::{DpuMode, SplitMode, Workloads};

/// Mode lists the splitter feeds the rectangle engine: spatial {1,1},
/// populated channel split {16,1}, unpopulated channel split {1,16}.
static TENSOR_MPE: Lazy<[Vec<DpuMode>; 3]> = Lazy::new(|| {
    [
        vec![DpuMode::new(1, 1)],
        vec![DpuMode::new(16, 1)],
        vec![DpuMode::new(1, 16)],
    ]
});

/// Entry point: walk the model, collect the tensors that need views, and
/// split each according to its strategy.
pub fn generate_subtensors(model: &mut ComputationModel, config: &GlobalConfig) -> Result<()> {
    let n = config.number_of_clusters as u64;
    if n <= 1 {
        return Ok(());
    }

    let tensors = collect_split_candidates(model);
    for tid in tensors {
        split_tensor(model, tid, n)?;
    }
    Ok(())
}

/// Tensors needing subtensors, ordered by name for determinism. Strategies
/// are inherited from the producing op (or its first input) when the tensor
/// carries none of its own.
fn collect_split_candidates(model: &mut ComputationModel) -> Vec<TensorId> {
    let mut picked: Vec<TensorId> = Vec::new();

    let mut insert = |model: &mut ComputationModel, tid: TensorId, parent: Option<OpId>| {
        if model.tensor(tid).has_subtensors() || picked.contains(&tid) {
            return;
        }
        if model.tensor(tid).strategy.is_none() {
            let inherited = parent.and_then(|p| {
                model.op(p).split_strategy.or_else(|| {
                    model
                        .op(p)
                        .inputs
                        .first()
                        .and_then(|&t| model.tensor(t).strategy)
                })
            });
            model.tensor_mut(tid).strategy = inherited;
        }
        if model.tensor(tid).strategy.is_some() {
            picked.push(tid);
        }
    };

    for op in model.op_ids().collect::<Vec<_>>() {
        match model.op(op).kind.clone() {
            OpKind::Input => {
                // Input activations get views only when split spatially.
                for tid in model.op(op).outputs.clone() {
                    if matches!(
                        model.tensor(tid).strategy,
                        Some(SplitStrategy::SplitOverH)
                            | Some(SplitStrategy::SplitOverHOverlapped)
                    ) {
                        insert(model, tid, Some(op));
                    }
                }
            }
            OpKind::Output => {
                for tid in model.op(op).inputs.clone() {
                    if matches!(
                        model.tensor(tid).strategy,
                        Some(SplitStrategy::SplitOverH)
                            | Some(SplitStrategy::SplitOverHOverlapped)
                    ) {
                        let src = model.source_op(tid);
                        insert(model, tid, src);
                    }
                }
            }
            OpKind::Implicit(_) | OpKind::DmaTask { .. } => {
                // Both sides of a data movement need matching views.
                for tid in model.op(op).inputs.clone() {
                    let src = model.source_op(tid);
                    insert(model, tid, src);
                }
                for tid in model.op(op).outputs.clone() {
                    insert(model, tid, Some(op));
                }
            }
            OpKind::DpuTask { .. } => {
                for tid in model.op(op).outputs.clone() {
                    insert(model, tid, Some(op));
                }
                for tid in model.op(op).inputs.clone() {
                    let src = model.source_op(tid);
                    insert(model, tid, src);
                    // Weights sparsity has no explicit constant op in the
                    // graph, so the companion is picked up here.
                    let t = model.tensor(tid);
                    if t.populated {
                        if let Some(sp) = t.sparsity {
                            insert(model, sp.sparsity_map, Some(op));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    picked.sort_by(|&a, &b| model.tensor(a).name.cmp(&model.tensor(b).name));
    picked.dedup();
    picked
}

fn split_tensor(model: &mut ComputationModel, tid: TensorId, n: u64) -> Result<()> {
    let strategy = match model.tensor(tid).strategy {
        Some(s) => s,
        None => return Ok(()),
    };

    #[cfg(feature = "tracing")]
    tracing::debug!(tensor = %model.tensor(tid).name, ?strategy, "splitting tensor");

    match strategy {
        SplitStrategy::Clustering => share_across_clusters(model, tid, n),
        SplitStrategy::SplitOverH => {
            let subs = split_over_h_views(model, tid, n)?;
            apply_split(model, tid, subs);
            Ok(())
        }
        SplitStrategy::ClusteringAndSoh => {
            // Double set: the producer writes broadcast copies, the consumer
            // reads height slices.
            let soh = split_over_h_views(model, tid, n)?;
            share_across_clusters(model, tid, n)?;
            model.tensor_mut(tid).consumer_subtensors = soh;
            Ok(())
        }
        SplitStrategy::HkSwitch => {
            let subs = split_over_h_views(model, tid, n)?;
            apply_split(model, tid, subs);
            Ok(())
        }
        SplitStrategy::SplitOverHOverlapped => {
            let mut subs = split_over_h_views(model, tid, n)?;
            if !model.tensor(tid).populated {
                extend_with_halo(model, tid, &mut subs);
                refresh_addresses(model, tid, &mut subs);
            }
            apply_split(model, tid, subs);
            Ok(())
        }
        SplitStrategy::SplitOverK => {
            let subs = split_over_k_views(model, tid, n)?;
            apply_split(model, tid, subs);
            Ok(())
        }
    }
}

/// Broadcast: every cluster holds the parent shape at the parent address.
fn share_across_clusters(model: &mut ComputationModel, tid: TensorId, n: u64) -> Result<()> {
    let tensor = model.tensor(tid);
    let shape = tensor.shape;
    let address = tensor.address;
    let quant = tensor.quant.clone();
    let subs = (0..n)
        .map(|i| SubTensor {
            offset: [0; 4],
            shape,
            address,
            locale_index: i as u32,
            sparsity_map_offset: tensor.sparsity.map(|_| 0),
            storage_element_offset: tensor
                .sparsity
                .and_then(|s| s.storage_elements.map(|_| 0)),
            quant: quant.clone(),
        })
        .collect();
    let t = model.tensor_mut(tid);
    t.subtensors = subs;
    t.broadcast = true;
    Ok(())
}

/// Height slices for one tensor. Unpopulated tensors are tiled by the
/// rectangle engine; populated ones produce a single slice duplicated per
/// cluster. Degenerate 1x1 spatial tensors degrade to broadcast.
fn split_over_h_views(
    model: &ComputationModel,
    tid: TensorId,
    n: u64,
) -> Result<Vec<SubTensor>> {
    let tensor = model.tensor(tid);
    let shape = tensor.shape;

    if !tensor.populated && shape.get(IO_WIDTH) == 1 && shape.get(IO_HEIGHT) == 1 {
        return Ok(broadcast_views(tensor, n));
    }

    let slices = if tensor.populated {
        let mut w = Workloads::new_populated(tensor.name.clone(), shape);
        match w.partition_rectangle_heuristic(
            &TENSOR_MPE[0],
            1,
            true,
            false,
            true,
            SplitMode::H,
        ) {
            Ok(()) => {
                let single = w.into_workloads();
                let mut repeated = Vec::with_capacity(n as usize * single.len());
                for _ in 0..n {
                    repeated.extend(single.iter().copied());
                }
                repeated
            }
            Err(_) => return Ok(broadcast_views(tensor, n)),
        }
    } else {
        let mut w = Workloads::new(tensor.name.clone(), shape);
        match w.partition_rectangle_heuristic(
            &TENSOR_MPE[0],
            n,
            true,
            false,
            true,
            SplitMode::H,
        ) {
            Ok(()) => w.into_workloads(),
            Err(_) => return Ok(broadcast_views(tensor, n)),
        }
    };

    if slices.len() < n as usize {
        return Ok(broadcast_views(tensor, n));
    }

    let mut subs = Vec::with_capacity(slices.len());
    for (i, slice) in slices.iter().enumerate() {
        let offset = [0, slice.min_y.max(0) as u64, 0, 0];
        let mut sub_shape = shape;
        sub_shape.set(IO_HEIGHT, slice.height());
        subs.push(make_subtensor(tensor, offset, sub_shape, i as u32));
    }
    Ok(subs)
}

/// Channel slices for SplitOverK. The engine tiles the channel axis in
/// groups of 16; when it returns fewer than N slices the 16-aligned
/// equal-slice allocator takes over, last slice absorbing the unaligned
/// remainder.
fn split_over_k_views(
    model: &ComputationModel,
    tid: TensorId,
    n: u64,
) -> Result<Vec<SubTensor>> {
    let tensor = model.tensor(tid);
    let shape = tensor.shape;
    let populated = tensor.populated;

    let channel_slot = if populated {
        KERNEL_OUTPUT_CHANNELS
    } else {
        IO_CHANNEL
    };
    let channels = shape.get(channel_slot);

    let mut w = if populated {
        Workloads::new_populated(tensor.name.clone(), shape)
    } else {
        Workloads::new(tensor.name.clone(), shape)
    };
    let attempt = if populated {
        w.partition_rectangle_heuristic(&TENSOR_MPE[1], n, true, false, true, SplitMode::Nc)
    } else {
        w.partition_rectangle_heuristic(&TENSOR_MPE[2], n, false, true, true, SplitMode::Nc)
    };

    let ranges: Vec<(u64, u64)> = match attempt {
        Ok(()) if w.len() == n as usize => w
            .workloads()
            .iter()
            .map(|wl| {
                if populated {
                    (wl.min_y.max(0) as u64, wl.height())
                } else {
                    (wl.min_x.max(0) as u64, wl.width())
                }
            })
            .collect(),
        _ => equal_slice_16_aligned(channels, n),
    };

    let mut subs = Vec::with_capacity(ranges.len());
    for (i, &(start, len)) in ranges.iter().enumerate() {
        let mut sub_shape = shape;
        sub_shape.set(channel_slot, len);
        let mut offset = [0u64; 4];
        offset[channel_slot] = start;
        let mut sub = make_subtensor(tensor, offset, sub_shape, i as u32);
        // Per-channel quantisation follows the slice.
        if populated {
            if let Some(q) = &tensor.quant {
                sub.quant = Some(q.slice(start as usize, len as usize));
            }
        }
        subs.push(sub);
    }
    Ok(subs)
}

/// Equal slices of 16-channel groups distributed round-robin; the last
/// slice takes the unaligned remainder.
fn equal_slice_16_aligned(channels: u64, n: u64) -> Vec<(u64, u64)> {
    let aligned_groups = channels / 16;
    let unaligned_remainder = channels % 16;

    let mut group_counts = vec![0u64; n as usize];
    let mut cluster = 0usize;
    for _ in 0..aligned_groups {
        group_counts[cluster] += 1;
        cluster = (cluster + 1) % n as usize;
    }

    let mut out = Vec::with_capacity(n as usize);
    let mut start = 0u64;
    for (i, &groups) in group_counts.iter().enumerate() {
        let mut len = groups * 16;
        if i == n as usize - 1 {
            len += unaligned_remainder;
        }
        out.push((start, len));
        start += len;
    }
    out
}

fn broadcast_views(tensor: &TensorDesc, n: u64) -> Vec<SubTensor> {
    (0..n)
        .map(|i| SubTensor {
            offset: [0; 4],
            shape: tensor.shape,
            address: tensor.address,
            locale_index: i as u32,
            sparsity_map_offset: tensor.sparsity.map(|_| 0),
            storage_element_offset: tensor
                .sparsity
                .and_then(|s| s.storage_elements.map(|_| 0)),
            quant: tensor.quant.clone(),
        })
        .collect()
}

/// Build one cluster view. The byte address is the linearised offset inside
/// the parent layout; sparsity companions are sliced in lock-step (one bit
/// per element for the map, one 4-byte entry per spatial point for the
/// storage-element table).
fn make_subtensor(tensor: &TensorDesc, offset: [u64; 4], shape: Shape, locale: u32) -> SubTensor {
    let elem_bytes = tensor.dtype.size_bytes();
    let linear = tensor
        .order
        .linear_offset(&offset, &tensor.shape, elem_bytes);
    let address = Some(tensor.address.unwrap_or(0) + linear);

    let element_index = tensor.order.linear_offset(&offset, &tensor.shape, 1);
    let sparsity_map_offset = tensor.sparsity.map(|_| element_index / 8);
    let storage_element_offset = tensor.sparsity.and_then(|s| {
        s.storage_elements
            .map(|_| offset[IO_HEIGHT] * tensor.shape.get(IO_WIDTH) * 4)
    });

    SubTensor {
        offset,
        shape,
        address,
        locale_index: locale,
        sparsity_map_offset,
        storage_element_offset,
        quant: None,
    }
}

fn apply_split(model: &mut ComputationModel, tid: TensorId, subs: Vec<SubTensor>) {
    let all_full_shape = {
        let t = model.tensor(tid);
        subs.iter().all(|s| s.shape == t.shape && s.offset == [0; 4])
    };
    let t = model.tensor_mut(tid);
    t.broadcast = all_full_shape;
    t.subtensors = subs;
}

/// Extend each height slice into its neighbours by the consumer's vertical
/// halo (kernel height minus one) so stencils read the rows they need.
fn extend_with_halo(model: &ComputationModel, tid: TensorId, subs: &mut [SubTensor]) {
    let kernel_h = consumer_kernel_height(model, tid).unwrap_or(1);
    if kernel_h <= 1 {
        return;
    }
    let halo_top = ((kernel_h - 1) / 2) as u64;
    let halo_bottom = (kernel_h - 1) as u64 - halo_top;
    let parent_h = model.tensor(tid).shape.get(IO_HEIGHT);

    for sub in subs.iter_mut() {
        let start = sub.offset[IO_HEIGHT].saturating_sub(halo_top);
        let end = (sub.offset[IO_HEIGHT] + sub.shape.get(IO_HEIGHT) + halo_bottom).min(parent_h);
        sub.offset[IO_HEIGHT] = start;
        sub.shape.set(IO_HEIGHT, end - start);
    }
}

fn refresh_addresses(model: &ComputationModel, tid: TensorId, subs: &mut [SubTensor]) {
    let tensor = model.tensor(tid);
    let elem_bytes = tensor.dtype.size_bytes();
    for sub in subs.iter_mut() {
        let linear = tensor
            .order
            .linear_offset(&sub.offset, &tensor.shape, elem_bytes);
        sub.address = Some(tensor.address.unwrap_or(0) + linear);
    }
}

/// Overlapped SOH feeds a channel-major convolution through DMA/Align
/// layers; step through up to two of them to find the DPU kernel.
fn consumer_kernel_height(model: &ComputationModel, tid: TensorId) -> Option<u16> {
    let mut sinks = model.sink_ops(tid);
    for _ in 0..2 {
        let first = *sinks.first()?;
        match model.op(first).kind {
            OpKind::DmaTask { .. } | OpKind::Implicit(ImplicitKind::Align) => {
                let out = *model.op(first).outputs.first()?;
                sinks = model.sink_ops(out);
            }
            _ => break,
        }
    }
    let first = *sinks.first()?;
    model.op(first).kernel().map(|k| k.kernel[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteen_aligned_fallback_last_takes_remainder() {
        let slices = equal_slice_16_aligned(100, 4);
        assert_eq!(slices.len(), 4);
        // Six aligned groups of 16 round-robin as 2/2/1/1; the last slice
        // also takes the 100 % 16 = 4 unaligned channels.
        assert_eq!(slices[0], (0, 32));
        assert_eq!(slices[1], (32, 32));
        assert_eq!(slices[2], (64, 16));
        assert_eq!(slices[3], (80, 20));
        assert_eq!(slices.iter().map(|s| s.1).sum::<u64>(), 100);
    }
}
