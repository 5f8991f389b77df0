//! Wire task structures: NNDMA, DPU invariant+variant, software layer,
//! and barrier configuration.

use serde::{Deserialize, Serialize};

use mosaic_core::prelude::*;
use mosaic_core::{Error, Result};

use crate::tensor_ref::TensorReference;
use crate::wire::{Reader, Writer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmaTask {
    pub direction: DmaDirection,
    pub src: TensorReference,
    pub dst: TensorReference,
    pub port: u8,
    pub compression: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpuVariant {
    pub cluster: u32,
    pub mpe_mode: u8,
    pub min_x: i32,
    pub max_x: i32,
    pub min_y: i32,
    pub max_y: i32,
    pub min_z: i32,
    pub max_z: i32,
    pub padding: [u16; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpuTask {
    pub task_op: DpuTaskOp,
    pub kernel: [u16; 2],
    pub stride: [u16; 2],
    pub pad: [u16; 4],
    pub input: TensorReference,
    pub parent_input: TensorReference,
    pub output: TensorReference,
    pub parent_output: TensorReference,
    pub weights: Option<TensorReference>,
    pub variants: Vec<DpuVariant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpaTask {
    pub kernel_name: String,
    pub inputs: Vec<TensorReference>,
    pub outputs: Vec<TensorReference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierEntry {
    pub id: u32,
    pub real_id: u32,
    pub producer_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskBody {
    Dma(DmaTask),
    Dpu(DpuTask),
    Upa(UpaTask),
    BarrierConfig(BarrierEntry),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub wait_barriers: Vec<u32>,
    pub update_barriers: Vec<u32>,
    pub body: TaskBody,
}

fn dma_direction_code(d: DmaDirection) -> u8 {
    match d {
        DmaDirection::DdrToCmx => 0,
        DmaDirection::CmxToDdr => 1,
        DmaDirection::CsramToCmx => 2,
        DmaDirection::CmxToUpa => 3,
        DmaDirection::UpaToCmx => 4,
        DmaDirection::HwToDdr => 5,
    }
}

fn dma_direction_from(v: u8) -> Result<DmaDirection> {
    Ok(match v {
        0 => DmaDirection::DdrToCmx,
        1 => DmaDirection::CmxToDdr,
        2 => DmaDirection::CsramToCmx,
        3 => DmaDirection::CmxToUpa,
        4 => DmaDirection::UpaToCmx,
        5 => DmaDirection::HwToDdr,
        _ => {
            return Err(Error::runtime(
                "serialiser",
                format!("unknown dma direction code {v}"),
            ))
        }
    })
}

fn dpu_op_code(op: DpuTaskOp) -> u8 {
    match op {
        DpuTaskOp::Conv => 0,
        DpuTaskOp::DepthwiseConv => 1,
        DpuTaskOp::MaxPool => 2,
        DpuTaskOp::AveragePool => 3,
        DpuTaskOp::Eltwise => 4,
        DpuTaskOp::ChannelMajorConvolution => 5,
        DpuTaskOp::HwConvert => 6,
        DpuTaskOp::Identity => 7,
        DpuTaskOp::FullyConnected => 8,
    }
}

fn dpu_op_from(v: u8) -> Result<DpuTaskOp> {
    Ok(match v {
        0 => DpuTaskOp::Conv,
        1 => DpuTaskOp::DepthwiseConv,
        2 => DpuTaskOp::MaxPool,
        3 => DpuTaskOp::AveragePool,
        4 => DpuTaskOp::Eltwise,
        5 => DpuTaskOp::ChannelMajorConvolution,
        6 => DpuTaskOp::HwConvert,
        7 => DpuTaskOp::Identity,
        8 => DpuTaskOp::FullyConnected,
        _ => {
            return Err(Error::runtime(
                "serialiser",
                format!("unknown dpu op code {v}"),
            ))
        }
    })
}

impl BarrierEntry {
    pub fn emit(&self, w: &mut Writer) {
        w.u32(self.id);
        w.u32(self.real_id);
        w.u32(self.producer_count);
        w.u32(self.consumer_count);
    }

    pub fn parse(r: &mut Reader<'_>) -> Result<BarrierEntry> {
        Ok(BarrierEntry {
            id: r.u32()?,
            real_id: r.u32()?,
            producer_count: r.u32()?,
            consumer_count: r.u32()?,
        })
    }
}

impl Task {
    pub fn emit(&self, w: &mut Writer) {
        w.str(&self.name);
        w.u32(self.wait_barriers.len() as u32);
        for &b in &self.wait_barriers {
            w.u32(b);
        }
        w.u32(self.update_barriers.len() as u32);
        for &b in &self.update_barriers {
            w.u32(b);
        }
        match &self.body {
            TaskBody::Dma(dma) => {
                w.u8(0);
                w.u8(dma_direction_code(dma.direction));
                dma.src.emit(w);
                dma.dst.emit(w);
                w.u8(dma.port);
                w.u8(dma.compression as u8);
            }
            TaskBody::Dpu(dpu) => {
                w.u8(1);
                w.u8(dpu_op_code(dpu.task_op));
                for v in dpu.kernel.iter().chain(&dpu.stride).chain(&dpu.pad) {
                    w.u16(*v);
                }
                dpu.input.emit(w);
                dpu.parent_input.emit(w);
                dpu.output.emit(w);
                dpu.parent_output.emit(w);
                match &dpu.weights {
                    Some(weights) => {
                        w.u8(1);
                        weights.emit(w);
                    }
                    None => w.u8(0),
                }
                w.u32(dpu.variants.len() as u32);
                for v in &dpu.variants {
                    w.u32(v.cluster);
                    w.u8(v.mpe_mode);
                    w.i32(v.min_x);
                    w.i32(v.max_x);
                    w.i32(v.min_y);
                    w.i32(v.max_y);
                    w.i32(v.min_z);
                    w.i32(v.max_z);
                    for &p in &v.padding {
                        w.u16(p);
                    }
                }
            }
            TaskBody::Upa(upa) => {
                w.u8(2);
                w.str(&upa.kernel_name);
                w.u32(upa.inputs.len() as u32);
                for t in &upa.inputs {
                    t.emit(w);
                }
                w.u32(upa.outputs.len() as u32);
                for t in &upa.outputs {
                    t.emit(w);
                }
            }
            TaskBody::BarrierConfig(entry) => {
                w.u8(3);
                entry.emit(w);
            }
        }
    }

    pub fn parse(r: &mut Reader<'_>) -> Result<Task> {
        let name = r.str()?;
        let wait_count = r.u32()? as usize;
        let mut wait_barriers = Vec::with_capacity(wait_count);
        for _ in 0..wait_count {
            wait_barriers.push(r.u32()?);
        }
        let update_count = r.u32()? as usize;
        let mut update_barriers = Vec::with_capacity(update_count);
        for _ in 0..update_count {
            update_barriers.push(r.u32()?);
        }

        let body = match r.u8()? {
            0 => {
                let direction = dma_direction_from(r.u8()?)?;
                let src = TensorReference::parse(r)?;
                let dst = TensorReference::parse(r)?;
                let port = r.u8()?;
                let compression = r.u8()? != 0;
                TaskBody::Dma(DmaTask {
                    direction,
                    src,
                    dst,
                    port,
                    compression,
                })
            }
            1 => {
                let task_op = dpu_op_from(r.u8()?)?;
                let mut fields = [0u16; 8];
                for f in fields.iter_mut() {
                    *f = r.u16()?;
                }
                let input = TensorReference::parse(r)?;
                let parent_input = TensorReference::parse(r)?;
                let output = TensorReference::parse(r)?;
                let parent_output = TensorReference::parse(r)?;
                let weights = if r.u8()? != 0 {
                    Some(TensorReference::parse(r)?)
                } else {
                    None
                };
                let variant_count = r.u32()? as usize;
                let mut variants = Vec::with_capacity(variant_count);
                for _ in 0..variant_count {
                    let cluster = r.u32()?;
                    let mpe_mode = r.u8()?;
                    let min_x = r.i32()?;
                    let max_x = r.i32()?;
                    let min_y = r.i32()?;
                    let max_y = r.i32()?;
                    let min_z = r.i32()?;
                    let max_z = r.i32()?;
                    let mut padding = [0u16; 4];
                    for p in padding.iter_mut() {
                        *p = r.u16()?;
                    }
                    variants.push(DpuVariant {
                        cluster,
                        mpe_mode,
                        min_x,
                        max_x,
                        min_y,
                        max_y,
                        min_z,
                        max_z,
                        padding,
                    });
                }
                TaskBody::Dpu(DpuTask {
                    task_op,
                    kernel: [fields[0], fields[1]],
                    stride: [fields[2], fields[3]],
                    pad: [fields[4], fields[5], fields[6], fields[7]],
                    input,
                    parent_input,
                    output,
                    parent_output,
                    weights,
                    variants,
                })
            }
            2 => {
                let kernel_name = r.str()?;
                let in_count = r.u32()? as usize;
                let mut inputs = Vec::with_capacity(in_count);
                for _ in 0..in_count {
                    inputs.push(TensorReference::parse(r)?);
                }
                let out_count = r.u32()? as usize;
                let mut outputs = Vec::with_capacity(out_count);
                for _ in 0..out_count {
                    outputs.push(TensorReference::parse(r)?);
                }
                TaskBody::Upa(UpaTask {
                    kernel_name,
                    inputs,
                    outputs,
                })
            }
            3 => TaskBody::BarrierConfig(BarrierEntry::parse(r)?),
            other => {
                return Err(Error::runtime(
                    "serialiser",
                    format!("unknown task body code {other}"),
                ))
            }
        };

        Ok(Task {
            name,
            wait_barriers,
            update_barriers,
            body,
        })
    }
}
