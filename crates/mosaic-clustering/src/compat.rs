//! Strategy compatibility fix-ups around spilling DMAs.
//!
//! Once spill DMAs exist, a tensor's split strategy can disagree with the
//! strategy of the op that consumes it on the far side of the DMA. This
//! pass walks every DMA, consults the incompatibility table, and repairs
//! the boundary either by overriding the tensor strategy (plus an
//! `OverwriteStrategy` tag the serialiser reads) or by promoting the
//! producer to the ClusteringAndSoh double set.

use mosaic_core::prelude::*;
use mosaic_core::tensor::OverwriteStrategy;

use crate::split::generate_subtensors;

/// Producer-tensor strategy / consumer-op strategy pairs that cannot meet
/// across a DMA without repair.
const INCOMPATIBLE: &[(SplitStrategy, SplitStrategy)] = &[
    (SplitStrategy::SplitOverHOverlapped, SplitStrategy::Clustering),
    (SplitStrategy::SplitOverHOverlapped, SplitStrategy::SplitOverK),
    (SplitStrategy::SplitOverH, SplitStrategy::Clustering),
    (SplitStrategy::SplitOverH, SplitStrategy::SplitOverK),
    (SplitStrategy::SplitOverK, SplitStrategy::SplitOverH),
    (SplitStrategy::Clustering, SplitStrategy::SplitOverH),
    (SplitStrategy::SplitOverK, SplitStrategy::HkSwitch),
    (SplitStrategy::Clustering, SplitStrategy::HkSwitch),
];

/// Repair strategy mismatches across spilling DMAs.
pub fn ensure_split_strategies(
    model: &mut ComputationModel,
    config: &GlobalConfig,
    target: &TargetDescriptor,
) -> Result<()> {
    if config.number_of_clusters <= 1 {
        return Ok(());
    }

    for dma in model.op_ids().collect::<Vec<_>>() {
        let direction = match model.op(dma).dma_direction() {
            Some(d) => d,
            None => continue,
        };
        if direction != DmaDirection::DdrToCmx && direction != DmaDirection::CsramToCmx {
            continue;
        }
        let (input, output) = match (
            model.op(dma).inputs.first().copied(),
            model.op(dma).outputs.first().copied(),
        ) {
            (Some(i), Some(o)) => (i, o),
            _ => continue,
        };
        if model.tensor(output).populated {
            continue;
        }

        let sinks = model.sink_ops(output);
        let sink = match sinks.first().copied() {
            Some(s) => s,
            None => continue,
        };
        // Strategy assignment already handled plain copies; DMA chains are
        // repaired separately by the consecutive-DMA workaround.
        if matches!(model.op(sink).kind, OpKind::Implicit(ImplicitKind::Copy)) {
            continue;
        }
        if model.op(sink).dma_direction().is_some() {
            continue;
        }

        channel_major_fixup(model, config, target, dma, sink)?;

        let op_strategy = match effective_op_strategy(model, sink) {
            Some(s) => s,
            None => continue,
        };
        let tensor_strategy = match model.tensor(output).strategy {
            Some(s) => s,
            None => continue,
        };

        if !INCOMPATIBLE.contains(&(tensor_strategy, op_strategy)) {
            continue;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            dma = %model.op(dma).name,
            ?tensor_strategy,
            ?op_strategy,
            "repairing strategy boundary"
        );

        match (tensor_strategy, op_strategy) {
            // A broadcast or channel-split producer feeding a height-split
            // consumer: promote the producer side to the double set so the
            // consumer can read SOH views without re-laying out DRAM.
            (SplitStrategy::Clustering, SplitStrategy::SplitOverH)
            | (SplitStrategy::SplitOverK, SplitStrategy::SplitOverH) => {
                retag_and_resplit(
                    model,
                    config,
                    &[input, output],
                    SplitStrategy::ClusteringAndSoh,
                )?;
            }
            // A height-split producer feeding a broadcast/channel-split
            // consumer: the DRAM copy is whole, so the destination becomes a
            // broadcast with the override tag recorded for the serialiser.
            (SplitStrategy::SplitOverH, _)
            | (SplitStrategy::SplitOverHOverlapped, _) => {
                retag_and_resplit(model, config, &[input, output], op_strategy)?;
                model.tensor_mut(output).overwrite_strategy =
                    Some(OverwriteStrategy::ClusteringToSoH);
            }
            _ => {
                retag_and_resplit(model, config, &[input, output], op_strategy)?;
            }
        }
    }
    Ok(())
}

/// DMA(CMX->DDR) -> DMA(DDR->CMX) chains feeding a channel-major SOH
/// convolution leave the intermediate tensor with a plain strategy; it must
/// be re-split with overlap so the second DMA moves the haloed rows.
pub fn consecutive_dma_workaround(
    model: &mut ComputationModel,
    config: &GlobalConfig,
    target: &TargetDescriptor,
) -> Result<()> {
    if config.number_of_clusters <= 1 || !target.supports_channel_major() {
        return Ok(());
    }

    for dma in model.op_ids().collect::<Vec<_>>() {
        if model.op(dma).dma_direction() != Some(DmaDirection::DdrToCmx) {
            continue;
        }
        let input = match model.op(dma).inputs.first().copied() {
            Some(t) => t,
            None => continue,
        };
        let parent = match model.source_op(input) {
            Some(p) => p,
            None => continue,
        };
        if model.op(parent).dma_direction() != Some(DmaDirection::CmxToDdr) {
            continue;
        }

        let output = match model.op(dma).outputs.first().copied() {
            Some(t) => t,
            None => continue,
        };
        let feeds_cm_soh = model.sink_ops(output).first().map_or(false, |&sink| {
            model.op(sink).dpu_task_op() == Some(DpuTaskOp::ChannelMajorConvolution)
                && model.op(sink).split_strategy == Some(SplitStrategy::SplitOverH)
        });
        if !feeds_cm_soh {
            continue;
        }

        retag_and_resplit(
            model,
            config,
            &[input, output],
            SplitStrategy::SplitOverHOverlapped,
        )?;
    }
    Ok(())
}

/// A channel-major convolution under SOH needs its DMA-fed input re-split
/// with overlap and in column-major order.
fn channel_major_fixup(
    model: &mut ComputationModel,
    config: &GlobalConfig,
    target: &TargetDescriptor,
    dma: OpId,
    sink: OpId,
) -> Result<()> {
    if !target.supports_channel_major() {
        return Ok(());
    }
    let output = model.op(dma).outputs[0];
    if model.tensor(output).strategy == Some(SplitStrategy::SplitOverHOverlapped) {
        return Ok(());
    }

    // Step over a trailing Align layer if present.
    let (cm_op, retag_align) = match model.op(sink).kind {
        OpKind::Implicit(ImplicitKind::Align) => {
            let align_out = match model.op(sink).outputs.first().copied() {
                Some(t) => t,
                None => return Ok(()),
            };
            match model.sink_ops(align_out).first().copied() {
                Some(next) => (next, Some(align_out)),
                None => return Ok(()),
            }
        }
        _ => (sink, None),
    };

    if model.op(cm_op).dpu_task_op() != Some(DpuTaskOp::ChannelMajorConvolution)
        || model.op(cm_op).split_strategy != Some(SplitStrategy::SplitOverH)
    {
        return Ok(());
    }

    let input = model.op(dma).inputs[0];
    let mut tensors = vec![input, output];
    if let Some(t) = retag_align {
        tensors.push(t);
    }
    // Channel-major hardware reads the activation column-major.
    for &t in &tensors {
        model.tensor_mut(t).order = Order::col_major();
    }
    retag_and_resplit(model, config, &tensors, SplitStrategy::SplitOverHOverlapped)
}

/// The consumer's effective strategy; every non-DMA sink is assumed to
/// share one.
fn effective_op_strategy(model: &ComputationModel, op: OpId) -> Option<SplitStrategy> {
    model.op(op).split_strategy.or_else(|| {
        model
            .op(op)
            .outputs
            .first()
            .and_then(|&t| model.tensor(t).strategy)
    })
}

fn retag_and_resplit(
    model: &mut ComputationModel,
    config: &GlobalConfig,
    tensors: &[TensorId],
    strategy: SplitStrategy,
) -> Result<()> {
    for &t in tensors {
        let tensor = model.tensor_mut(t);
        tensor.clear_subtensors();
        tensor.strategy = Some(strategy);
    }
    generate_subtensors(model, config)
}
