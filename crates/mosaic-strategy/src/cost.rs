//! Target-specific transition cost model.
//!
//! Edge weights of the meta-graph: the cost of running `child` under
//! strategy `b` given that `parent` ran under strategy `a`. Accounts for
//! compute cycles, weight and spill DMA traffic, re-layout on
//! incompatible boundaries, and pipelining overlap.

use mosaic_core::prelude::*;
use mosaic_core::shape::{IO_CHANNEL, IO_HEIGHT, IO_WIDTH};

use crate::candidates::{OpStrategy, StreamAxis};

/// Producer/consumer clustering pairs that force a repair DMA when they
/// meet across a spill; without a spill they cannot meet at all.
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

/// Fixed cost of launching one extra stream slice.
const STREAM_OVERHEAD_CYCLES: f64 = 16.0;

pub struct CostModel<'a> {
    pub model: &'a ComputationModel,
    pub config: &'a GlobalConfig,
}

impl<'a> CostModel<'a> {
    pub fn new(model: &'a ComputationModel, config: &'a GlobalConfig) -> Self {
        Self { model, config }
    }

    /// Weight of the meta-graph edge (parent, a) -> (child, b).
    pub fn transition_cost(
        &self,
        parent: OpId,
        child: OpId,
        a: &OpStrategy,
        b: &OpStrategy,
    ) -> f64 {
        let child_desc = self.model.op(child);

        // The network output lives in DRAM; its producer must spill.
        if matches!(child_desc.kind, OpKind::Output) {
            return if a.spilling { 0.0 } else { f64::INFINITY };
        }

        if child_desc.attrs.bool_or("force_clustering", false)
            && b.clustering != SplitStrategy::Clustering
        {
            return f64::INFINITY;
        }
        if self.model.op(parent).attrs.bool_or("force_clustering", false)
            && a.clustering != SplitStrategy::Clustering
        {
            return f64::INFINITY;
        }

        let incompatible = INCOMPATIBLE.contains(&(a.clustering, b.clustering));
        if incompatible && !a.spilling {
            // Without a DRAM round-trip there is nowhere to re-split.
            return f64::INFINITY;
        }

        if !child_desc.is_hardwarisable() {
            // Software layers: pure DMA traffic in and out of DDR.
            return self.activation_bytes(child) as f64 / self.config.memory_bandwidth;
        }

        if self.working_set_per_cluster(child, b) > self.config.cmx_bytes {
            return f64::INFINITY;
        }

        let mut cost = self.compute_cycles(child, b);

        let mut weight_cycles =
            self.weight_bytes(child) as f64 / self.config.memory_bandwidth;
        if b.weights_sparsity {
            weight_cycles *= 0.6;
        }
        // K-streams overlap their weight fetches with compute only when the
        // parent output stayed resident; a spilled parent serialises them.
        if b.streams_over(StreamAxis::K) > 1 && a.spilling {
            weight_cycles *= 1.5;
        }
        cost += weight_cycles;

        // Each extra stream pays a descriptor/trigger round trip.
        cost += (b.total_streams() - 1) as f64 * STREAM_OVERHEAD_CYCLES;

        if a.spilling {
            // Parent output made a DRAM round trip: one write, one read.
            let spilled = self.output_bytes(parent) as f64;
            cost += 2.0 * spilled / self.config.memory_bandwidth;
        }

        if incompatible {
            // Repair DMA re-splits the activation in DRAM.
            cost += self.activation_bytes(child) as f64 / self.config.memory_bandwidth;
        }
        if a.clustering == SplitStrategy::SplitOverK
            && b.clustering == SplitStrategy::SplitOverH
        {
            // Weights re-layout penalty on the K->H boundary.
            cost += self.weight_bytes(child) as f64 / self.config.memory_bandwidth;
        }

        cost
    }

    /// MAC-bound cycle estimate for one op under a strategy, after cluster
    /// and DPU parallelism.
    fn compute_cycles(&self, op: OpId, strategy: &OpStrategy) -> f64 {
        let out = match self.model.op(op).outputs.first() {
            Some(&t) => self.model.tensor(t).shape,
            None => return 0.0,
        };
        let macs = (out.get(IO_WIDTH) * out.get(IO_HEIGHT)) as f64
            * ((out.get(IO_CHANNEL) as f64) / 16.0).ceil();
        let cluster_speedup = match strategy.clustering {
            SplitStrategy::Clustering => 1.0,
            _ => self.config.number_of_clusters as f64,
        };
        macs / (self.config.dpus_per_cluster() as f64 * cluster_speedup)
    }

    /// Per-cluster scratchpad bytes the op needs resident at once.
    pub fn working_set_per_cluster(&self, op: OpId, strategy: &OpStrategy) -> u64 {
        let desc = self.model.op(op);
        let n = self.config.number_of_clusters as u64;

        let spatial_div = if strategy.clustering.splits_height() { n } else { 1 };
        let act_div = spatial_div * strategy.streams_over(StreamAxis::H).max(1);

        let channel_div = if strategy.clustering == SplitStrategy::SplitOverK {
            n
        } else {
            1
        };
        let weight_div = channel_div * strategy.streams_over(StreamAxis::K).max(1);

        let mut total = 0u64;
        for &t in &desc.inputs {
            let tensor = self.model.tensor(t);
            if tensor.populated {
                total += tensor.byte_size() / weight_div.max(1);
            } else {
                total += tensor.byte_size() / act_div.max(1);
            }
        }
        for &t in &desc.outputs {
            let out_div = if strategy.clustering == SplitStrategy::SplitOverK {
                n
            } else {
                act_div
            };
            total += self.model.tensor(t).byte_size() / out_div.max(1);
        }
        total
    }

    fn output_bytes(&self, op: OpId) -> u64 {
        self.model
            .op(op)
            .outputs
            .iter()
            .map(|&t| self.model.tensor(t).byte_size())
            .sum()
    }

    fn weight_bytes(&self, op: OpId) -> u64 {
        self.model
            .op(op)
            .inputs
            .iter()
            .filter(|&&t| self.model.tensor(t).populated)
            .map(|&t| self.model.tensor(t).packed_byte_size())
            .sum()
    }

    fn activation_bytes(&self, op: OpId) -> u64 {
        self.model
            .op(op)
            .inputs
            .iter()
            .filter(|&&t| !self.model.tensor(t).populated)
            .map(|&t| self.model.tensor(t).byte_size())
            .sum()
    }
}
