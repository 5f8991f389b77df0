//! The per-layer workload container and its validation rules.

use serde::{Deserialize, Serialize};

use mosaic_core::shape::{IO_CHANNEL, IO_HEIGHT, IO_WIDTH};
use mosaic_core::workload::Workload;
use mosaic_core::shape::Shape;

use crate::cost::{aggregate_cycles, workload_cycles, CostFunction};
use crate::rect::{partition, DpuMode, SplitMode};
use crate::{Result, WorkloadError};

/// Workload list generated for one layer (or one tensor being split).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workloads {
    layer_name: String,
    tensor_shape: Shape,
    populated: bool,
    workloads: Vec<Workload>,
    /// Min and max execution cycles from the last cost evaluation.
    execution_cycles: [f64; 2],
    mean_execution_cycles: f64,
}

impl Workloads {
    pub fn new(layer_name: impl Into<String>, tensor_shape: Shape) -> Self {
        Self {
            layer_name: layer_name.into(),
            tensor_shape,
            populated: false,
            workloads: Vec::new(),
            execution_cycles: [0.0, 0.0],
            mean_execution_cycles: 0.0,
        }
    }

    pub fn new_populated(layer_name: impl Into<String>, tensor_shape: Shape) -> Self {
        let mut w = Self::new(layer_name, tensor_shape);
        w.populated = true;
        w
    }

    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    pub fn shape(&self) -> &Shape {
        &self.tensor_shape
    }

    pub fn workloads(&self) -> &[Workload] {
        &self.workloads
    }

    pub fn into_workloads(self) -> Vec<Workload> {
        self.workloads
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }

    pub fn add(&mut self, workload: Workload) {
        self.workloads.push(workload);
    }

    pub fn execution_cycles(&self) -> [f64; 2] {
        self.execution_cycles
    }

    pub fn mean_execution_cycles(&self) -> f64 {
        self.mean_execution_cycles
    }

    /// Tile this tensor into `n_workloads` rectangles under the given MPE
    /// mode list and axis constraints.
    pub fn partition_rectangle_heuristic(
        &mut self,
        mode_list: &[DpuMode],
        n_workloads: u64,
        split_over_h: bool,
        split_over_w: bool,
        split_symmetric: bool,
        split_mode: SplitMode,
    ) -> Result<()> {
        let w = self.tensor_shape.get(IO_WIDTH);
        let h = self.tensor_shape.get(IO_HEIGHT);
        if w == 0 || h == 0 {
            return Err(WorkloadError::InvalidShape {
                tensor: self.layer_name.clone(),
                w,
                h,
            });
        }

        match partition(
            &self.tensor_shape,
            self.populated,
            mode_list,
            n_workloads,
            split_over_h,
            split_over_w,
            split_symmetric,
            split_mode,
        ) {
            Some(workloads) if !workloads.is_empty() => {
                self.workloads = workloads;
                Ok(())
            }
            _ => Err(WorkloadError::CannotSlice(self.layer_name.clone())),
        }
    }

    /// Evaluate this list under a cost function with `n_dpu` processors per
    /// cluster.
    pub fn generate_execution_cycles(
        &mut self,
        n_dpu: usize,
        cost_function: CostFunction,
    ) -> Result<()> {
        if n_dpu < 1 {
            return Err(WorkloadError::Argument(format!(
                "invalid number of DPUs: {n_dpu}"
            )));
        }
        let channels = self.tensor_shape.get(IO_CHANNEL);
        let per_workload: Vec<f64> = self
            .workloads
            .iter()
            .map(|wl| workload_cycles(wl, channels))
            .collect();
        let (lo, hi) = aggregate_cycles(&per_workload, n_dpu, cost_function);
        self.execution_cycles = [lo, hi];
        self.mean_execution_cycles = (lo + hi) / 2.0;
        Ok(())
    }

    pub fn total_volume(&self) -> u64 {
        self.workloads.iter().map(|w| w.volume()).sum()
    }

    pub fn no_overlap(&self) -> bool {
        for (i, a) in self.workloads.iter().enumerate() {
            for b in &self.workloads[i + 1..] {
                if a.overlaps(b) {
                    return false;
                }
            }
        }
        true
    }

    /// Bounding shape over all workloads, in WHC order.
    pub fn shape_from_min_max(&self) -> Shape {
        let max_x = self.workloads.iter().map(|w| w.max_x).max().unwrap_or(-1);
        let max_y = self.workloads.iter().map(|w| w.max_y).max().unwrap_or(-1);
        let max_z = self.workloads.iter().map(|w| w.max_z).max().unwrap_or(-1);
        Shape::new(
            (max_x + 1).max(0) as u64,
            (max_y + 1).max(0) as u64,
            (max_z + 1).max(0) as u64,
            1,
        )
    }

    /// A partition is valid when the union of the workloads has the volume
    /// and the bounds of the tensor and no two workloads intersect.
    pub fn validate(&self, shape: &Shape) -> bool {
        if self.workloads.is_empty() {
            return false;
        }
        if self.total_volume() != shape.total_size_no_batch() {
            return false;
        }
        let bounds = self.shape_from_min_max();
        let expect_c = shape.get(IO_CHANNEL).max(1);
        if bounds.get(IO_WIDTH) != shape.get(IO_WIDTH)
            || bounds.get(IO_HEIGHT) != shape.get(IO_HEIGHT)
            || bounds.get(IO_CHANNEL).max(1) != expect_c
        {
            return false;
        }
        self.no_overlap()
    }
}

/// Candidate workload counts for one layer: 1, multiples of the per-cluster
/// DPU count, and power-of-two divisors of the MPE grid, capped at
/// `max_splits`.
pub fn split_pool(
    shape: &Shape,
    n_dpu_per_cluster: usize,
    mode_lists: &[Vec<DpuMode>],
    max_splits: usize,
) -> Vec<usize> {
    let mut pool = vec![1usize];

    let x_dim = shape.get(IO_WIDTH) as f64;
    let y_dim = shape.get(IO_HEIGHT) as f64;

    let mut max_splits_xy = Vec::new();
    for modes in mode_lists {
        for mode in modes {
            max_splits_xy
                .push(((x_dim / mode.h as f64).ceil() * (y_dim / mode.w as f64).ceil()) as usize);
        }
    }

    let mut i = n_dpu_per_cluster;
    while i + n_dpu_per_cluster <= max_splits {
        pool.push(i);
        i += n_dpu_per_cluster;
    }

    for &max_xy in &max_splits_xy {
        if max_xy == 0 {
            continue;
        }
        let levels = (max_xy as f64).log2().ceil() as u32;
        for j in 0..levels {
            let p = 1usize << j;
            if max_xy % p == 0 && max_xy / p <= max_splits {
                pool.push(max_xy / p);
            }
        }
    }

    pool.sort_unstable();
    pool.dedup();
    if pool.is_empty() {
        pool.push(4);
    }
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rect::{DpuMode, SplitMode};

    #[test]
    fn four_workloads_over_56x56_matrix_mode() {
        let mut w = Workloads::new("conv1", Shape::new(56, 56, 64, 1));
        w.partition_rectangle_heuristic(
            &[DpuMode::new(4, 4)],
            4,
            true,
            true,
            true,
            SplitMode::Hw,
        )
        .unwrap();
        assert_eq!(w.len(), 4);
        assert!(w.validate(&Shape::new(56, 56, 64, 1)));
        for wl in w.workloads() {
            assert_eq!(wl.volume() / 64, 784);
        }
    }
}
