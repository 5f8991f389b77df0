//! End-to-end compilation of a small network: the full pass chain produces
//! a parseable, deterministic container.

use mosaic_core::prelude::*;
use mosaic_pipeline::{compile, Session};
use mosaic_serial::{Blob, TaskBody};

fn small_network() -> ComputationModel {
    let mut model = ComputationModel::new();
    let act = Shape::new(16, 16, 32, 1);

    let mut t_in = TensorDesc::new("net_in", act, DType::U8);
    t_in.location = MemoryLocation::ProgrammableInput;
    let t_in = model.add_tensor(t_in);

    let t1 = model.add_tensor(TensorDesc::new("t1", act, DType::U8));
    let mut t2 = TensorDesc::new("net_out", act, DType::U8);
    t2.location = MemoryLocation::ProgrammableOutput;
    let t2 = model.add_tensor(t2);

    let mut w1 =
        TensorDesc::new("w1", Shape::new(1, 1, 32, 32), DType::U8).populated();
    w1.data = Some((0..1024u32).map(|i| (i % 251) as u8).collect());
    let w1 = model.add_tensor(w1);
    let mut w2 =
        TensorDesc::new("w2", Shape::new(1, 1, 32, 32), DType::U8).populated();
    w2.data = Some((0..1024u32).map(|i| (i % 13) as u8).collect());
    let w2 = model.add_tensor(w2);

    let mut input = OpDesc::new("input", OpKind::Input);
    input.outputs.push(t_in);
    model.add_op(input);

    let mut conv1 = OpDesc::new(
        "conv1",
        OpKind::DpuTask {
            task_op: DpuTaskOp::Conv,
            kernel: KernelInfo::default(),
        },
    );
    conv1.inputs.push(t_in);
    conv1.inputs.push(w1);
    conv1.outputs.push(t1);
    model.add_op(conv1);

    let mut conv2 = OpDesc::new(
        "conv2",
        OpKind::DpuTask {
            task_op: DpuTaskOp::Conv,
            kernel: KernelInfo::default(),
        },
    );
    conv2.inputs.push(t1);
    conv2.inputs.push(w2);
    conv2.outputs.push(t2);
    model.add_op(conv2);

    let mut output = OpDesc::new("output", OpKind::Output);
    output.inputs.push(t2);
    model.add_op(output);

    model
}

fn session() -> Session {
    let config = GlobalConfig {
        number_of_clusters: 2,
        number_of_dpus: 10,
        cmx_bytes: 1024 * 1024,
        ..GlobalConfig::default()
    };
    Session::new(config, TargetDescriptor::default())
}

#[test]
fn test_compile_small_network() {
    let mut model = small_network();
    let out = compile(&mut model, &session()).expect("compile");

    assert!(!out.blob.is_empty());
    assert!(out.summary.scheduled_tasks > 0);
    assert!(out.summary.barrier_count > 0);
    assert_eq!(out.summary.blob_bytes, out.blob.len());

    let blob = Blob::parse(&out.blob).expect("parse");
    assert_eq!(blob.header.resources.clusters, 2);
    assert_eq!(blob.header.net_inputs.len(), 1);
    assert_eq!(blob.header.net_outputs.len(), 1);
    assert_eq!(blob.header.net_inputs[0].name, "net_in");

    // Both convolutions and their weight loads made it into the lists.
    assert!(!blob.compute_tasks.is_empty());
    assert!(!blob.dma_tasks.is_empty());
    assert_eq!(blob.barrier_table.len(), out.summary.barrier_count);

    // Both weight payloads landed in the binary-data section.
    assert_eq!(blob.binary_data.len(), 2);
    assert_eq!(blob.binary_data[0].original_len, 1024);
}

#[test]
fn test_compilation_is_reproducible() {
    let mut first_model = small_network();
    let first = compile(&mut first_model, &session()).expect("compile");
    let mut second_model = small_network();
    let second = compile(&mut second_model, &session()).expect("compile");

    assert_eq!(first.blob, second.blob);
    assert_eq!(
        first.summary.strategy_fingerprint,
        second.summary.strategy_fingerprint
    );
    assert_eq!(
        first.summary.schedule_fingerprint,
        second.summary.schedule_fingerprint
    );
    assert_eq!(first.summary.blob_fingerprint, second.summary.blob_fingerprint);
}

#[test]
fn test_schedule_respects_every_data_edge() {
    let mut model = small_network();
    let out = compile(&mut model, &session()).expect("compile");

    // conv1 strictly precedes conv2 in emission, with its inputs before it.
    let names: Vec<String> = out
        .schedule
        .iter()
        .map(|s| model.op(s.op).name.clone())
        .collect();
    let exact = |needle: &str| {
        names
            .iter()
            .position(|n| n == needle)
            .unwrap_or_else(|| panic!("{needle} missing from schedule"))
    };
    let prefixed = |needle: &str| {
        names
            .iter()
            .position(|n| n.starts_with(needle))
            .unwrap_or_else(|| panic!("{needle} missing from schedule"))
    };
    assert!(exact("conv1") < exact("conv2"));
    assert!(prefixed("dma_in_conv1") < exact("conv1"));
    assert!(prefixed("dma_in_conv2") < exact("conv2"));
}

#[test]
fn test_weight_compression_marks_the_dma() {
    let mut model = small_network();
    let config = GlobalConfig {
        number_of_clusters: 2,
        number_of_dpus: 10,
        cmx_bytes: 1024 * 1024,
        huffman_compression: true,
        ..GlobalConfig::default()
    };
    // Highly repetitive payload well above the 4 KiB threshold.
    let w_big = {
        let mut w =
            TensorDesc::new("w_big", Shape::new(3, 3, 32, 32), DType::U8).populated();
        w.data = Some(vec![1u8; 9216]);
        model.add_tensor(w)
    };
    let conv1 = model.op_by_name("conv1").expect("conv1");
    model.op_mut(conv1).inputs.push(w_big);

    let session = Session::new(config, TargetDescriptor::default());
    let out = compile(&mut model, &session).expect("compile");
    let blob = Blob::parse(&out.blob).expect("parse");

    let compressed_dma = blob.dma_tasks.iter().any(|t| match &t.body {
        TaskBody::Dma(dma) => dma.compression,
        _ => false,
    });
    assert!(compressed_dma, "no DMA carried the compression flag");

    // The packed payload is shorter than the raw tensor.
    let entry = blob
        .binary_data
        .iter()
        .find(|e| e.name == "w_big")
        .expect("w_big packed");
    assert!((entry.words.len() * 8) < 9216);
    assert_eq!(entry.original_len as usize, entry.to_bytes().len());
}

#[test]
fn test_bad_config_aborts_before_any_pass() {
    let mut model = small_network();
    let config = GlobalConfig {
        number_of_clusters: 0,
        ..GlobalConfig::default()
    };
    let session = Session::new(config, TargetDescriptor::default());
    let err = compile(&mut model, &session).expect_err("invalid config");
    assert!(matches!(err, Error::Argument { .. }));
    assert_eq!(err.exit_code(), 2);
}
