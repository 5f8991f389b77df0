//! Serialisation: the DMA broadcast rule table, barrier count expansion,
//! quantisation reduction, byte determinism, and container round-trips.

use mosaic_clustering::{ensure_split_strategies, generate_subtensors};
use mosaic_core::prelude::*;
use mosaic_core::tensor::OverwriteStrategy;
use mosaic_core::workload::Workload;
use mosaic_scheduler::{insert_barriers, BarrierSchedule};
use mosaic_serial::barrier_table::count_producer_consumer_tasks;
use mosaic_serial::dma::build_dma_tasks;
use mosaic_serial::{serialize, Blob, TaskBody, TensorReference};

fn two_cluster_config() -> GlobalConfig {
    GlobalConfig {
        number_of_clusters: 2,
        number_of_dpus: 10,
        ..GlobalConfig::default()
    }
}

fn dpu_kind() -> OpKind {
    OpKind::DpuTask {
        task_op: DpuTaskOp::Conv,
        kernel: KernelInfo::default(),
    }
}

/// Producer (SOH) -> store DMA -> DRAM -> load DMA -> consumer whose
/// strategy is Clustering: the classic spill boundary of scenario "SOH to
/// Clustering across a DMA".
fn soh_to_clustering_model() -> (ComputationModel, OpId, TensorId) {
    let mut model = ComputationModel::new();
    let shape = Shape::new(16, 16, 16, 1);

    let mut t_src = TensorDesc::new("prod_in", shape, DType::U8);
    t_src.location = MemoryLocation::NnCmx;
    t_src.strategy = Some(SplitStrategy::SplitOverH);
    let t_src = model.add_tensor(t_src);

    let mut t_cmx = TensorDesc::new("prod_out", shape, DType::U8);
    t_cmx.location = MemoryLocation::NnCmx;
    t_cmx.strategy = Some(SplitStrategy::SplitOverH);
    let t_cmx = model.add_tensor(t_cmx);

    let mut t_ddr = TensorDesc::new("prod_spilled", shape, DType::U8);
    t_ddr.location = MemoryLocation::DdrHeap;
    t_ddr.strategy = Some(SplitStrategy::SplitOverH);
    let t_ddr = model.add_tensor(t_ddr);

    let mut t_back = TensorDesc::new("cons_in", shape, DType::U8);
    t_back.location = MemoryLocation::NnCmx;
    t_back.strategy = Some(SplitStrategy::SplitOverH);
    let t_back = model.add_tensor(t_back);

    let t_out = model.add_tensor(TensorDesc::new("cons_out", shape, DType::U8));

    let mut producer = OpDesc::new("producer", dpu_kind());
    producer.split_strategy = Some(SplitStrategy::SplitOverH);
    producer.inputs.push(t_src);
    producer.outputs.push(t_cmx);
    model.add_op(producer);

    let mut store = OpDesc::new(
        "dma_store",
        OpKind::DmaTask {
            direction: DmaDirection::CmxToDdr,
        },
    );
    store.inputs.push(t_cmx);
    store.outputs.push(t_ddr);
    model.add_op(store);

    let mut load = OpDesc::new(
        "dma_load",
        OpKind::DmaTask {
            direction: DmaDirection::DdrToCmx,
        },
    );
    load.inputs.push(t_ddr);
    load.outputs.push(t_back);
    let load = model.add_op(load);

    let mut consumer = OpDesc::new("consumer", dpu_kind());
    consumer.split_strategy = Some(SplitStrategy::Clustering);
    consumer.inputs.push(t_back);
    consumer.outputs.push(t_out);
    model.add_op(consumer);

    (model, load, t_back)
}

#[test]
fn test_soh_to_clustering_boundary_broadcasts_the_load() {
    let (mut model, load, t_back) = soh_to_clustering_model();
    let config = two_cluster_config();

    generate_subtensors(&mut model, &config).expect("split");
    ensure_split_strategies(&mut model, &config, &TargetDescriptor::default())
        .expect("fixups");

    // The fix-up stamped the override tag onto the consumer's input.
    assert_eq!(
        model.tensor(t_back).overwrite_strategy,
        Some(OverwriteStrategy::ClusteringToSoH)
    );
    assert_eq!(
        model.tensor(t_back).strategy,
        Some(SplitStrategy::Clustering)
    );

    // Emission: one DMA whose destination spans both clusters.
    let mut port = 0u8;
    let tasks = build_dma_tasks(&model, &config, load, &mut port).expect("dma");
    assert_eq!(tasks.len(), 1);
    match &tasks[0].body {
        TaskBody::Dma(dma) => {
            let mut locales = dma.dst.locale_index.clone();
            locales.sort_unstable();
            assert_eq!(locales, vec![0, 1]);
        }
        other => panic!("expected a DMA body, got {other:?}"),
    }
}

#[test]
fn test_split_source_emits_one_dma_per_cluster() {
    let mut model = ComputationModel::new();
    let shape = Shape::new(16, 16, 16, 1);

    let mut t_ddr = TensorDesc::new("act_ddr", shape, DType::U8);
    t_ddr.strategy = Some(SplitStrategy::SplitOverH);
    let t_ddr = model.add_tensor(t_ddr);
    let mut t_cmx = TensorDesc::new("act_cmx", shape, DType::U8);
    t_cmx.location = MemoryLocation::NnCmx;
    t_cmx.strategy = Some(SplitStrategy::SplitOverH);
    let t_cmx = model.add_tensor(t_cmx);

    let mut load = OpDesc::new(
        "dma_split",
        OpKind::DmaTask {
            direction: DmaDirection::DdrToCmx,
        },
    );
    load.inputs.push(t_ddr);
    load.outputs.push(t_cmx);
    let load = model.add_op(load);

    let mut sink = OpDesc::new("conv", dpu_kind());
    sink.split_strategy = Some(SplitStrategy::SplitOverH);
    sink.inputs.push(t_cmx);
    let t_out = model.add_tensor(TensorDesc::new("conv_out", shape, DType::U8));
    sink.outputs.push(t_out);
    model.add_op(sink);

    let config = two_cluster_config();
    generate_subtensors(&mut model, &config).expect("split");

    let mut port = 0u8;
    let tasks = build_dma_tasks(&model, &config, load, &mut port).expect("dma");
    assert_eq!(tasks.len(), 2);
    for (i, task) in tasks.iter().enumerate() {
        match &task.body {
            TaskBody::Dma(dma) => {
                assert_eq!(dma.dst.locale_index, vec![i as u32]);
                // H is split across clusters: 8 rows each (NCHW dims are
                // emitted as [N, C, H, W]).
                assert_eq!(dma.dst.dimensions, vec![1, 16, 8, 16]);
            }
            other => panic!("expected a DMA body, got {other:?}"),
        }
    }
}

#[test]
fn test_barrier_counts_expand_workloads_and_clusters() {
    let config = two_cluster_config();
    let mut model = ComputationModel::new();
    let shape = Shape::new(16, 16, 16, 1);

    let t_out = model.add_tensor(TensorDesc::new("out", shape, DType::U8));
    let mut op = OpDesc::new("conv_soh", dpu_kind());
    op.split_strategy = Some(SplitStrategy::SplitOverH);
    op.outputs.push(t_out);
    op.workloads = vec![
        vec![Workload::new(MpeMode::Matrix); 2],
        vec![Workload::new(MpeMode::Matrix); 3],
    ];
    let op = model.add_op(op);

    // SOH: the per-cluster workload counts add up.
    assert_eq!(
        count_producer_consumer_tasks(&model, &config, op, true).expect("count"),
        5
    );

    // Clustering: workloads of cluster 0 replicate onto every cluster.
    model.op_mut(op).split_strategy = Some(SplitStrategy::Clustering);
    assert_eq!(
        count_producer_consumer_tasks(&model, &config, op, true).expect("count"),
        4
    );
}

#[test]
fn test_quant_emission_reduces_uniform_vectors() {
    let mut tensor = TensorDesc::new("quantised", Shape::new(8, 8, 4, 1), DType::U8);
    let mut quant = QuantParams::new(vec![7, 7, 7, 7], vec![0.5; 4], vec![], vec![]);
    quant.quantize(vec![300, 300, 300, 300], vec![9, 9, 9, 9]);
    quant.post_shift = -2;
    tensor.quant = Some(quant);

    let reference = TensorReference::build(&tensor);
    // Zero point: one byte, element 0 only.
    assert_eq!(reference.quant_zero, vec![7u8]);
    // Mult and shift collapse when all channels agree.
    assert_eq!(reference.quant_mult, vec![300u16]);
    assert_eq!(reference.quant_shift, vec![9u8]);
    assert_eq!(reference.quant_post_shift, -2);
}

#[test]
fn test_reference_reverses_dims_and_strides() {
    let mut tensor = TensorDesc::new("ref", Shape::new(8, 4, 2, 1), DType::Fp16);
    tensor.order = Order::nchw();
    let reference = TensorReference::build(&tensor);

    // WHCN (8,4,2,1) emits as [N, C, H, W].
    assert_eq!(reference.dimensions, vec![1, 2, 4, 8]);
    // Strides lead with the element size, then outermost-first.
    assert_eq!(reference.strides[0], 2);
    assert_eq!(reference.strides.len(), 5);
    // NCHW: W stride (last) is one element.
    assert_eq!(*reference.strides.last().unwrap(), 2);
    // N stride is the full tensor.
    assert_eq!(reference.strides[1], 8 * 4 * 2 * 2);
}

fn serialisable_model() -> (ComputationModel, Vec<OpId>, BarrierSchedule, GlobalConfig) {
    let config = two_cluster_config();
    let (mut model, load, _) = soh_to_clustering_model();
    generate_subtensors(&mut model, &config).expect("split");

    let order: Vec<OpId> = model
        .op_ids()
        .filter(|&id| model.op(id).is_executable())
        .collect();
    let barriers = insert_barriers(&mut model, &order, false).expect("barriers");
    let _ = load;
    (model, order, barriers, config)
}

#[test]
fn test_serialisation_is_deterministic() {
    let (model, order, barriers, config) = serialisable_model();
    let target = TargetDescriptor::default();

    let first = serialize(&model, &order, &barriers, &config, &target).expect("bytes");
    let second = serialize(&model, &order, &barriers, &config, &target).expect("bytes");
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[test]
fn test_container_round_trips_bit_exactly() {
    let (model, order, barriers, config) = serialisable_model();
    let target = TargetDescriptor::default();

    let bytes = serialize(&model, &order, &barriers, &config, &target).expect("bytes");
    let blob = Blob::parse(&bytes).expect("parse");
    assert_eq!(blob.emit(), bytes);

    assert_eq!(blob.header.resources.clusters, 2);
    assert_eq!(blob.barrier_table.len(), blob.barrier_tasks.len());
}

#[test]
fn test_corrupted_container_is_rejected() {
    let (model, order, barriers, config) = serialisable_model();
    let target = TargetDescriptor::default();

    let mut bytes = serialize(&model, &order, &barriers, &config, &target).expect("bytes");
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    assert!(Blob::parse(&bytes).is_err());
}
