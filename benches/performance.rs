//! Criterion benchmarks for the two hot paths: rectangle tiling and
//! feasible scheduling.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use mosaic_core::prelude::*;
use mosaic_scheduler::{DagAdapter, FeasibleMemoryScheduler};
use mosaic_workloads::{DpuMode, SplitMode, Workloads};

fn bench_rectangle_heuristic(c: &mut Criterion) {
    let shape = Shape::new(224, 224, 64, 1);
    c.bench_function("rectangle_56_workloads", |b| {
        b.iter(|| {
            let mut workloads = Workloads::new("bench", black_box(shape));
            workloads
                .partition_rectangle_heuristic(
                    &[DpuMode::new(4, 4), DpuMode::new(1, 16)],
                    black_box(20),
                    true,
                    true,
                    false,
                    SplitMode::Hw,
                )
                .expect("partition");
            workloads
        })
    });
}

fn chain_model(depth: usize, bytes: u64) -> ComputationModel {
    let mut model = ComputationModel::new();
    let mut prev: Option<TensorId> = None;
    for i in 0..depth {
        let mut tensor = TensorDesc::new(
            format!("t{i:03}"),
            Shape::new(bytes, 1, 1, 1),
            DType::U8,
        );
        tensor.location = MemoryLocation::NnCmx;
        let tid = model.add_tensor(tensor);
        let mut op = OpDesc::new(
            format!("op{i:03}"),
            OpKind::DpuTask {
                task_op: DpuTaskOp::Eltwise,
                kernel: KernelInfo::default(),
            },
        );
        if let Some(p) = prev {
            op.inputs.push(p);
        }
        op.outputs.push(tid);
        model.add_op(op);
        prev = Some(tid);
    }
    model
}

fn bench_feasible_scheduler(c: &mut Criterion) {
    let config = GlobalConfig {
        number_of_clusters: 1,
        number_of_dpus: 5,
        cmx_bytes: 8 * 1024,
        ..GlobalConfig::default()
    };
    // A 64-deep chain of 2 KiB tensors in an 8 KiB scratchpad keeps the
    // eviction machinery honest.
    let model = chain_model(64, 2 * 1024);
    c.bench_function("schedule_chain_64", |b| {
        b.iter(|| {
            let dag = DagAdapter::new(&model, &config);
            FeasibleMemoryScheduler::new(&dag, config.cmx_bytes, config.memory_bandwidth)
                .and_then(|s| s.run())
                .expect("schedule")
        })
    });
}

criterion_group!(benches, bench_rectangle_heuristic, bench_feasible_scheduler);
criterion_main!(benches);
