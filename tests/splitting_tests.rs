//! Subtensor splitting: per-cluster views agree with the parent shape,
//! offsets, addresses, and sparsity companions.

use mosaic_clustering::generate_subtensors;
use mosaic_core::prelude::*;
use mosaic_core::shape::{IO_CHANNEL, IO_HEIGHT, KERNEL_OUTPUT_CHANNELS};
use mosaic_core::tensor::Sparsity;

fn four_cluster_config() -> GlobalConfig {
    GlobalConfig {
        number_of_clusters: 4,
        number_of_dpus: 20,
        ..GlobalConfig::default()
    }
}

/// Input op -> tensor -> DPU consumer, with the tensor pre-tagged.
fn model_with_input_tensor(desc: TensorDesc) -> (ComputationModel, TensorId) {
    let mut model = ComputationModel::new();
    let tid = model.add_tensor(desc);
    let out = model.add_tensor(TensorDesc::new("conv_out", Shape::new(224, 224, 8, 1), DType::U8));

    let mut input = OpDesc::new("input", OpKind::Input);
    input.outputs.push(tid);
    model.add_op(input);

    let mut conv = OpDesc::new(
        "conv",
        OpKind::DpuTask {
            task_op: DpuTaskOp::Conv,
            kernel: KernelInfo {
                kernel: [3, 3],
                stride: [1, 1],
                pad: [1, 1, 1, 1],
                dilation: 1,
            },
        },
    );
    conv.split_strategy = Some(SplitStrategy::SplitOverH);
    conv.inputs.push(tid);
    conv.outputs.push(out);
    model.add_op(conv);

    (model, tid)
}

#[test]
fn test_split_over_h_four_clusters_224() {
    let mut desc = TensorDesc::new("input_tensor", Shape::new(224, 224, 3, 1), DType::U8);
    desc.order = Order::nhwc();
    desc.strategy = Some(SplitStrategy::SplitOverH);
    let (mut model, tid) = model_with_input_tensor(desc);

    generate_subtensors(&mut model, &four_cluster_config()).expect("split");

    let tensor = model.tensor(tid);
    assert_eq!(tensor.subtensors.len(), 4);
    assert!(!tensor.is_broadcasted());

    let expected_offsets = [0u64, 56, 112, 168];
    let slice_bytes = 56 * 224 * 3;
    for (i, sub) in tensor.subtensors.iter().enumerate() {
        assert_eq!(sub.offset[IO_HEIGHT], expected_offsets[i]);
        assert_eq!(sub.shape.dims(), [224, 56, 3, 1]);
        assert_eq!(sub.locale_index, i as u32);
        // Contiguous per-cluster addresses, one H-slice apart.
        assert_eq!(sub.address, Some(i as u64 * slice_bytes));
    }

    // Non-broadcast invariant: the slices tile the parent exactly.
    let covered: u64 = tensor
        .subtensors
        .iter()
        .map(|s| s.shape.get(IO_HEIGHT))
        .sum();
    assert_eq!(covered, 224);
}

#[test]
fn test_clustering_broadcasts_full_shape() {
    let mut desc = TensorDesc::new("bias_like", Shape::new(16, 16, 32, 1), DType::U8);
    desc.strategy = Some(SplitStrategy::Clustering);
    let (mut model, tid) = model_with_input_tensor(desc);

    generate_subtensors(&mut model, &four_cluster_config()).expect("split");

    let tensor = model.tensor(tid);
    assert!(tensor.is_broadcasted());
    assert_eq!(tensor.subtensors.len(), 4);
    for sub in &tensor.subtensors {
        assert_eq!(sub.shape, tensor.shape);
        assert_eq!(sub.offset, [0; 4]);
    }
}

#[test]
fn test_split_over_k_sixteen_aligned() {
    let mut desc = TensorDesc::new("act_k", Shape::new(8, 8, 64, 1), DType::U8);
    desc.strategy = Some(SplitStrategy::SplitOverK);
    let (mut model, tid) = model_with_input_tensor(desc);

    generate_subtensors(&mut model, &four_cluster_config()).expect("split");

    let tensor = model.tensor(tid);
    assert_eq!(tensor.subtensors.len(), 4);
    let mut covered = 0;
    for sub in &tensor.subtensors {
        let c = sub.shape.get(IO_CHANNEL);
        assert_eq!(c % 16, 0);
        assert_eq!(sub.offset[IO_CHANNEL], covered);
        covered += c;
    }
    assert_eq!(covered, 64);
}

#[test]
fn test_populated_split_over_k_slices_quant() {
    let mut weights = TensorDesc::new("weights", Shape::new(1, 1, 64, 128), DType::U8).populated();
    weights.strategy = Some(SplitStrategy::SplitOverK);
    let mut quant = QuantParams::new(
        vec![0],
        (0..128).map(|i| i as f64).collect(),
        vec![],
        vec![],
    );
    quant.quantize((0..128u32).collect(), vec![8; 128]);
    weights.quant = Some(quant);

    let mut model = ComputationModel::new();
    let wid = model.add_tensor(weights);
    let out = model.add_tensor(TensorDesc::new("out", Shape::new(8, 8, 128, 1), DType::U8));
    let mut constant = OpDesc::new("weights_const", OpKind::Constant);
    constant.outputs.push(wid);
    model.add_op(constant);
    let mut conv = OpDesc::new(
        "conv",
        OpKind::DpuTask {
            task_op: DpuTaskOp::Conv,
            kernel: KernelInfo::default(),
        },
    );
    conv.split_strategy = Some(SplitStrategy::SplitOverK);
    conv.inputs.push(wid);
    conv.outputs.push(out);
    model.add_op(conv);

    generate_subtensors(&mut model, &four_cluster_config()).expect("split");

    let tensor = model.tensor(wid);
    assert_eq!(tensor.subtensors.len(), 4);
    let mut start = 0u64;
    for sub in &tensor.subtensors {
        let oc = sub.shape.get(KERNEL_OUTPUT_CHANNELS);
        assert_eq!(sub.offset[KERNEL_OUTPUT_CHANNELS], start);
        // Per-channel quantisation follows the slice.
        let q = sub.quant.as_ref().expect("sliced quant");
        assert_eq!(q.mult.len() as u64, oc);
        assert_eq!(q.mult[0], start as u32);
        start += oc;
    }
    assert_eq!(start, 128);
}

#[test]
fn test_overlapped_split_extends_by_halo() {
    let mut desc = TensorDesc::new("cm_input", Shape::new(224, 224, 3, 1), DType::U8);
    desc.strategy = Some(SplitStrategy::SplitOverHOverlapped);
    let (mut model, tid) = model_with_input_tensor(desc);

    generate_subtensors(&mut model, &four_cluster_config()).expect("split");

    let tensor = model.tensor(tid);
    assert_eq!(tensor.subtensors.len(), 4);

    // 3x3 kernel: each interior boundary overlaps by kernel_h - 1 rows.
    let s0 = &tensor.subtensors[0];
    let s1 = &tensor.subtensors[1];
    let s0_end = s0.offset[IO_HEIGHT] + s0.shape.get(IO_HEIGHT);
    assert!(s0_end > s1.offset[IO_HEIGHT]);
    assert_eq!(s0_end - s1.offset[IO_HEIGHT], 2);

    // Slices stay inside the parent.
    for sub in &tensor.subtensors {
        assert!(sub.offset[IO_HEIGHT] + sub.shape.get(IO_HEIGHT) <= 224);
    }
}

#[test]
fn test_clustering_and_soh_double_set() {
    let mut desc = TensorDesc::new("switch_tensor", Shape::new(64, 64, 16, 1), DType::U8);
    desc.strategy = Some(SplitStrategy::ClusteringAndSoh);
    let (mut model, tid) = model_with_input_tensor(desc);

    generate_subtensors(&mut model, &four_cluster_config()).expect("split");

    let tensor = model.tensor(tid);
    // Producer side: broadcast copies.
    assert_eq!(tensor.subtensors.len(), 4);
    assert!(tensor.is_broadcasted());
    for sub in &tensor.subtensors {
        assert_eq!(sub.shape, tensor.shape);
    }
    // Consumer side: height slices.
    assert_eq!(tensor.consumer_subtensors.len(), 4);
    let covered: u64 = tensor
        .consumer_subtensors
        .iter()
        .map(|s| s.shape.get(IO_HEIGHT))
        .sum();
    assert_eq!(covered, 64);
}

#[test]
fn test_sparse_tensor_companions_split_in_lockstep() {
    let mut model = ComputationModel::new();
    let map = model.add_tensor(TensorDesc::new(
        "act_sm",
        Shape::new(32, 32, 16, 1),
        DType::U8,
    ));
    let se = model.add_tensor(TensorDesc::new(
        "act_se",
        Shape::new(32, 32, 1, 1),
        DType::I32,
    ));
    let mut desc = TensorDesc::new("act", Shape::new(32, 32, 16, 1), DType::U8);
    desc.order = Order::nhwc();
    desc.strategy = Some(SplitStrategy::SplitOverH);
    desc.sparsity = Some(Sparsity {
        sparsity_map: map,
        storage_elements: Some(se),
    });
    let tid = model.add_tensor(desc);

    let mut input = OpDesc::new("input", OpKind::Input);
    input.outputs.push(tid);
    model.add_op(input);
    let out = model.add_tensor(TensorDesc::new("out", Shape::new(32, 32, 16, 1), DType::U8));
    let mut conv = OpDesc::new(
        "conv",
        OpKind::DpuTask {
            task_op: DpuTaskOp::Conv,
            kernel: KernelInfo::default(),
        },
    );
    conv.split_strategy = Some(SplitStrategy::SplitOverH);
    conv.inputs.push(tid);
    conv.outputs.push(out);
    model.add_op(conv);

    generate_subtensors(&mut model, &four_cluster_config()).expect("split");

    let tensor = model.tensor(tid);
    assert_eq!(tensor.subtensors.len(), 4);
    for (i, sub) in tensor.subtensors.iter().enumerate() {
        // One bit per element for the map; one 4-byte entry per spatial
        // point for the storage elements.
        let row = sub.offset[IO_HEIGHT];
        assert_eq!(sub.sparsity_map_offset, Some(row * 32 * 16 / 8));
        assert_eq!(sub.storage_element_offset, Some(row * 32 * 4));
        assert_eq!(sub.locale_index, i as u32);
    }
}
