//! Strategy selection: section extraction, the whole-graph solve, and the
//! streaming/pipelining outcome on a constrained linear graph.

use mosaic_core::prelude::*;
use mosaic_strategy::subgraphs::{data_children, lcsa, non_exclusive_nodes};
use mosaic_strategy::{StrategyManager, StreamAxis};

fn dpu(model: &mut ComputationModel, name: &str, input: TensorId, out: TensorId) -> OpId {
    let mut op = OpDesc::new(
        name,
        OpKind::DpuTask {
            task_op: DpuTaskOp::Conv,
            kernel: KernelInfo::default(),
        },
    );
    op.inputs.push(input);
    op.outputs.push(out);
    model.add_op(op)
}

fn activation(model: &mut ComputationModel, name: &str, shape: Shape) -> TensorId {
    model.add_tensor(TensorDesc::new(name, shape, DType::U8))
}

fn weights(model: &mut ComputationModel, name: &str, shape: Shape) -> TensorId {
    model.add_tensor(TensorDesc::new(name, shape, DType::U8).populated())
}

/// input -> conv1 -> conv2 -> conv3 -> output, shapes sized so conv2's
/// working set only fits the scratchpad when its weights stream over K.
fn linear_model() -> (ComputationModel, GlobalConfig) {
    let mut model = ComputationModel::new();
    let act = Shape::new(8, 8, 64, 1);

    let t_in = activation(&mut model, "t_in", act);
    let t1 = activation(&mut model, "t1", act);
    let t2 = activation(&mut model, "t2", act);
    let t3 = activation(&mut model, "t3", act);

    let w1 = weights(&mut model, "w1", Shape::new(1, 1, 64, 64));
    let w2 = weights(&mut model, "w2", Shape::new(3, 3, 64, 64));
    let w3 = weights(&mut model, "w3", Shape::new(1, 1, 64, 64));

    let mut input = OpDesc::new("input", OpKind::Input);
    input.outputs.push(t_in);
    model.add_op(input);

    let c1 = dpu(&mut model, "conv1", t_in, t1);
    model.op_mut(c1).inputs.push(w1);
    let c2 = dpu(&mut model, "conv2", t1, t2);
    model.op_mut(c2).inputs.push(w2);
    let c3 = dpu(&mut model, "conv3", t2, t3);
    model.op_mut(c3).inputs.push(w3);

    let mut output = OpDesc::new("output", OpKind::Output);
    output.inputs.push(t3);
    model.add_op(output);

    // conv2: in 4096 + out 4096 + weights 36864 = 45056 bytes. Halving the
    // activations (H-streaming) still leaves the weights whole, so only
    // K-streaming brings the working set under the cap.
    let config = GlobalConfig {
        number_of_clusters: 1,
        number_of_dpus: 5,
        cmx_bytes: 30_000,
        ..GlobalConfig::default()
    };
    (model, config)
}

#[test]
fn test_k_streaming_avoids_the_spill_and_pipelines_weights() {
    let (mut model, config) = linear_model();
    StrategyManager::new(&mut model, &config)
        .optimize()
        .expect("solve");

    let c2 = model.op_by_name("conv2").expect("conv2");
    let streaming = model.op(c2).streaming.expect("streaming set");
    assert!(
        streaming[StreamAxis::K as usize] > 1,
        "conv2 must stream over K, got {streaming:?}"
    );
    assert_eq!(model.op(c2).pipelining, Pipelining::PipelineWeights);

    // conv1 fits outright and must not pay a spill.
    let c1 = model.op_by_name("conv1").expect("conv1");
    assert!(!model.op(c1).spilling);
    assert_eq!(model.op(c1).streaming, Some([1; 5]));

    // The op feeding the network output writes DRAM.
    let c3 = model.op_by_name("conv3").expect("conv3");
    assert!(model.op(c3).spilling);
}

#[test]
fn test_streaming_ops_place_their_output_in_dram() {
    let (mut model, config) = linear_model();
    StrategyManager::new(&mut model, &config)
        .optimize()
        .expect("solve");

    let c2 = model.op_by_name("conv2").expect("conv2");
    let out = model.op(c2).outputs[0];
    assert_eq!(model.tensor(out).location, MemoryLocation::DdrHeap);
}

/// input -> head -> {left, right} -> join -> output.
fn diamond_model() -> (ComputationModel, GlobalConfig) {
    let mut model = ComputationModel::new();
    let shape = Shape::new(16, 16, 32, 1);

    let t_in = activation(&mut model, "t_in", shape);
    let t_head = activation(&mut model, "t_head", shape);
    let t_left = activation(&mut model, "t_left", shape);
    let t_right = activation(&mut model, "t_right", shape);
    let t_join = activation(&mut model, "t_join", shape);

    let mut input = OpDesc::new("input", OpKind::Input);
    input.outputs.push(t_in);
    model.add_op(input);

    dpu(&mut model, "head", t_in, t_head);
    dpu(&mut model, "left", t_head, t_left);
    dpu(&mut model, "right", t_head, t_right);

    let mut join = OpDesc::new(
        "join",
        OpKind::DpuTask {
            task_op: DpuTaskOp::Eltwise,
            kernel: KernelInfo::default(),
        },
    );
    join.inputs.push(t_left);
    join.inputs.push(t_right);
    join.outputs.push(t_join);
    model.add_op(join);

    let mut output = OpDesc::new("output", OpKind::Output);
    output.inputs.push(t_join);
    model.add_op(output);

    let config = GlobalConfig {
        number_of_clusters: 2,
        number_of_dpus: 10,
        cmx_bytes: 512 * 1024,
        ..GlobalConfig::default()
    };
    (model, config)
}

#[test]
fn test_lcsa_of_a_diamond_is_the_join() {
    let (model, _config) = diamond_model();
    let head = model.op_by_name("head").expect("head");
    let join = model.op_by_name("join").expect("join");
    let output = model.op_by_name("output").expect("output");

    let topo = model.topological_order().expect("topo");
    assert_eq!(lcsa(&model, &topo, head, output).expect("lcsa"), join);
    assert!(non_exclusive_nodes(&model, head, join).is_empty());
    assert_eq!(data_children(&model, head).len(), 2);
}

#[test]
fn test_diamond_solves_and_annotates_every_op() {
    let (mut model, config) = diamond_model();
    StrategyManager::new(&mut model, &config)
        .optimize()
        .expect("solve");

    for name in ["head", "left", "right", "join"] {
        let op = model.op_by_name(name).expect(name);
        assert!(
            model.op(op).split_strategy.is_some(),
            "{name} missing strategy"
        );
        assert!(model.op(op).streaming.is_some(), "{name} missing streaming");
    }
}

#[test]
fn test_multiple_inputs_rejected() {
    let mut model = ComputationModel::new();
    let t0 = activation(&mut model, "t0", Shape::new(8, 8, 16, 1));
    let t1 = activation(&mut model, "t1", Shape::new(8, 8, 16, 1));
    let mut i0 = OpDesc::new("input0", OpKind::Input);
    i0.outputs.push(t0);
    model.add_op(i0);
    let mut i1 = OpDesc::new("input1", OpKind::Input);
    i1.outputs.push(t1);
    model.add_op(i1);

    let config = GlobalConfig {
        number_of_clusters: 1,
        number_of_dpus: 5,
        ..GlobalConfig::default()
    };
    let err = StrategyManager::new(&mut model, &config)
        .optimize()
        .expect_err("two inputs");
    assert!(matches!(err, Error::Argument { .. }));
}
