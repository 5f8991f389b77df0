//! Rectangle-engine behaviour and the workload invariants: the union of a
//! workload list covers the shape, every box stays inside it, and no two
//! boxes intersect.

use mosaic_core::workload::MpeMode;
use mosaic_core::shape::Shape;
use mosaic_workloads::{
    aggregate_cycles, greedy_task_assignment, split_pool, CostFunction, DpuMode, SplitMode,
    Workloads,
};

#[test]
fn test_four_workloads_over_56x56_mpe_4x4() {
    let shape = Shape::new(56, 56, 64, 1);
    let mut workloads = Workloads::new("conv_56", shape);
    workloads
        .partition_rectangle_heuristic(&[DpuMode::new(4, 4)], 4, true, true, true, SplitMode::Hw)
        .expect("56x56 must slice into 4");

    assert_eq!(workloads.len(), 4);
    assert!(workloads.validate(&shape));
    assert!(workloads.no_overlap());

    for wl in workloads.workloads() {
        assert_eq!(wl.mpe_mode, MpeMode::Matrix);
        // Each quadrant holds 56*56/4 = 784 spatial cells.
        assert_eq!(wl.width() * wl.height(), 784);
        assert!(wl.max_x < 56 && wl.max_y < 56);
    }
}

#[test]
fn test_uneven_split_covers_whole_tensor() {
    let shape = Shape::new(14, 14, 16, 1);
    let mut workloads = Workloads::new("conv_14", shape);
    workloads
        .partition_rectangle_heuristic(&[DpuMode::new(1, 1)], 3, true, false, true, SplitMode::H)
        .expect("height split");

    assert_eq!(workloads.len(), 3);
    assert!(workloads.validate(&shape));
    // Last slice absorbs the remainder.
    let heights: Vec<u64> = workloads.workloads().iter().map(|w| w.height()).collect();
    assert_eq!(heights.iter().sum::<u64>(), 14);
    assert_eq!(heights[2], 4);
}

#[test]
fn test_forbidden_axis_fails_over_to_caller() {
    let shape = Shape::new(2, 2, 16, 1);
    let mut workloads = Workloads::new("tiny", shape);
    // 2x2 cannot be cut into 16 pieces along H alone.
    let result = workloads.partition_rectangle_heuristic(
        &[DpuMode::new(1, 1)],
        16,
        true,
        false,
        true,
        SplitMode::H,
    );
    assert!(result.is_err());
}

#[test]
fn test_non_symmetric_split_considered() {
    let shape = Shape::new(16, 16, 16, 1);
    let mut workloads = Workloads::new("conv_16", shape);
    workloads
        .partition_rectangle_heuristic(
            &[DpuMode::new(4, 4)],
            5,
            true,
            true,
            false,
            SplitMode::Hw,
        )
        .expect("non-symmetric 5-way split");
    assert!(!workloads.is_empty());
    assert!(workloads.no_overlap());
    // Every box stays inside the shape even if the count is not exactly 5.
    for wl in workloads.workloads() {
        assert!(wl.max_x < 16 && wl.max_y < 16);
    }
}

#[test]
fn test_cost_function_aggregates() {
    let per_workload = [4.0, 4.0, 4.0, 4.0];

    let (lo, hi) = aggregate_cycles(&per_workload, 4, CostFunction::MinMaxWorkloads);
    assert_eq!(lo, 4.0);
    assert_eq!(hi, 8.0);

    let (lo, hi) = aggregate_cycles(&per_workload, 1, CostFunction::CriticalPath);
    assert_eq!(lo, 16.0);
    assert_eq!(hi, 16.0);

    let (lo, _) = aggregate_cycles(&per_workload, 4, CostFunction::Balanced);
    assert_eq!(lo, -1.0);

    let (greedy, _) = aggregate_cycles(&per_workload, 2, CostFunction::Greedy);
    assert_eq!(greedy, 8.0);
}

#[test]
fn test_greedy_assignment_is_a_makespan() {
    let costs = [10.0, 10.0, 1.0, 1.0];
    // Two processors: {10,1} and {10,1}.
    assert_eq!(greedy_task_assignment(2, &costs), 11.0);
    // One processor takes everything.
    assert_eq!(greedy_task_assignment(1, &costs), 22.0);
}

#[test]
fn test_split_pool_contains_dpu_multiples_and_grid_divisors() {
    let shape = Shape::new(56, 56, 64, 1);
    let pool = split_pool(&shape, 5, &[vec![DpuMode::new(4, 4)]], 50);
    assert!(pool.contains(&1));
    assert!(pool.contains(&5));
    // 14*14 = 196 grid cells; 196/4 = 49 is an admissible power-of-two
    // division below the cap.
    assert!(pool.contains(&49));
    assert!(pool.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_execution_cycles_scale_with_channels() {
    let shape = Shape::new(32, 32, 32, 1);
    let mut workloads = Workloads::new("conv", shape);
    workloads
        .partition_rectangle_heuristic(&[DpuMode::new(4, 4)], 4, true, true, true, SplitMode::Hw)
        .expect("split");
    workloads
        .generate_execution_cycles(5, CostFunction::CriticalPath)
        .expect("cycles");
    let [lo, hi] = workloads.execution_cycles();
    assert!(lo > 0.0 && hi >= lo);
    assert!(workloads.mean_execution_cycles() > 0.0);
}
