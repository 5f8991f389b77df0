//! Candidate strategy tuples per op.

use serde::{Deserialize, Serialize};

use mosaic_core::prelude::*;
use mosaic_core::shape::{IO_CHANNEL, IO_HEIGHT};

/// Streaming axes, in the W,H,C,K,N order of the streaming shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamAxis {
    W = 0,
    H = 1,
    C = 2,
    K = 3,
    N = 4,
}

/// One candidate assignment for one op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpStrategy {
    pub clustering: SplitStrategy,
    /// Temporal tiling factors over W,H,C,K,N.
    pub streaming: [u64; 5],
    /// Output written to DRAM instead of staying in scratchpad.
    pub spilling: bool,
    pub input_sparsity: bool,
    pub output_sparsity: bool,
    pub weights_sparsity: bool,
}

impl OpStrategy {
    pub fn clustering_only() -> Self {
        Self {
            clustering: SplitStrategy::Clustering,
            streaming: [1; 5],
            spilling: true,
            input_sparsity: false,
            output_sparsity: false,
            weights_sparsity: false,
        }
    }

    pub fn streams_over(&self, axis: StreamAxis) -> u64 {
        self.streaming[axis as usize]
    }

    pub fn total_streams(&self) -> u64 {
        self.streaming.iter().product::<u64>().max(1)
    }
}

/// Enumerate candidate tuples for `op`. Constants and barriers never reach
/// the solver; implicit and IO ops ride along with a single clustering
/// candidate so the layered graph stays connected.
pub fn strategies_for_op(
    model: &ComputationModel,
    config: &GlobalConfig,
    op: OpId,
) -> Vec<OpStrategy> {
    let desc = model.op(op);
    let n = config.number_of_clusters as u64;

    if !desc.is_optimisable() {
        let mut only = OpStrategy::clustering_only();
        // IO and implicit ops do not produce compute output to spill.
        only.spilling = matches!(desc.kind, OpKind::UpaTask { .. });
        return vec![only];
    }

    if !desc.is_hardwarisable() {
        // Software layers execute whole tensors from DDR.
        return vec![OpStrategy::clustering_only()];
    }

    let forced_clustering = desc.attrs.bool_or("force_clustering", false);
    let weights_sparsity = desc.attrs.bool_or("weights_sparsity", false);

    let out_shape = desc
        .outputs
        .first()
        .map(|&t| model.tensor(t).shape)
        .unwrap_or(Shape::new(1, 1, 1, 1));
    let out_h = out_shape.get(IO_HEIGHT);
    let out_c = out_shape.get(IO_CHANNEL);

    let mut clusterings = vec![SplitStrategy::Clustering];
    if !forced_clustering && n > 1 {
        if out_h >= n {
            clusterings.push(SplitStrategy::SplitOverH);
        }
        if out_c >= 16 * n {
            clusterings.push(SplitStrategy::SplitOverK);
        }
    }

    // One axis streams at a time; K for weights, H for activations.
    let mut streamings: Vec<[u64; 5]> = vec![[1; 5]];
    for k in [2u64, 4] {
        if out_c >= 16 * k {
            let mut s = [1u64; 5];
            s[StreamAxis::K as usize] = k;
            streamings.push(s);
        }
    }
    for h in [2u64, 4] {
        if out_h >= h * n.max(1) {
            let mut s = [1u64; 5];
            s[StreamAxis::H as usize] = h;
            streamings.push(s);
        }
    }

    let mut out = Vec::new();
    for &clustering in &clusterings {
        for &streaming in &streamings {
            for &spilling in &[false, true] {
                out.push(OpStrategy {
                    clustering,
                    streaming,
                    spilling,
                    input_sparsity: false,
                    output_sparsity: false,
                    weights_sparsity,
                });
            }
        }
    }
    out
}
