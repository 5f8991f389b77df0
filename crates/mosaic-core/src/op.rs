//! Op descriptors: tagged kinds, typed attribute bag, strategy annotations.
//!
//! Ops are parameterised compute nodes; the compiler never interprets their
//! numerical semantics, only shapes, attributes, and a small set of traits.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::id::{BarrierId, TensorId};
use crate::shape::Shape;
use crate::tensor::SplitStrategy;
use crate::workload::Workload;

/// Hardware sub-type of a DPU task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DpuTaskOp {
    Conv,
    DepthwiseConv,
    MaxPool,
    AveragePool,
    Eltwise,
    ChannelMajorConvolution,
    HwConvert,
    Identity,
    FullyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DmaDirection {
    DdrToCmx,
    CmxToDdr,
    CsramToCmx,
    CmxToUpa,
    UpaToCmx,
    HwToDdr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImplicitKind {
    Concat,
    Slice,
    Align,
    Crop,
    Reshape,
    Permute,
    Resample,
    Copy,
}

/// Kernel geometry of a DPU task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    /// (width, height)
    pub kernel: [u16; 2],
    pub stride: [u16; 2],
    /// left, right, top, bottom
    pub pad: [u16; 4],
    pub dilation: u16,
}

impl Default for KernelInfo {
    fn default() -> Self {
        Self {
            kernel: [1, 1],
            stride: [1, 1],
            pad: [0; 4],
            dilation: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    DpuTask {
        task_op: DpuTaskOp,
        kernel: KernelInfo,
    },
    DmaTask {
        direction: DmaDirection,
    },
    /// Software kernel executed on the UPA shaves.
    UpaTask {
        kernel_name: String,
    },
    BarrierTask,
    Implicit(ImplicitKind),
    Input,
    Output,
    Constant,
}

/// Typed attribute value; the bag keeps ops extensible by downstream passes
/// without reintroducing stringly-typed access everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Shape(Shape),
    UIntVec(Vec<u64>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrBag {
    entries: BTreeMap<String, AttrValue>,
}

impl AttrBag {
    pub fn set(&mut self, key: impl Into<String>, value: AttrValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.entries.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        match self.entries.get(key) {
            Some(AttrValue::Bool(b)) => Ok(*b),
            Some(_) => Err(Error::argument(
                "attrs",
                format!("attribute '{key}' is not a bool"),
            )),
            None => Err(Error::argument("attrs", format!("missing attribute '{key}'"))),
        }
    }

    pub fn get_uint(&self, key: &str) -> Result<u64> {
        match self.entries.get(key) {
            Some(AttrValue::UInt(v)) => Ok(*v),
            Some(AttrValue::Int(v)) if *v >= 0 => Ok(*v as u64),
            Some(_) => Err(Error::argument(
                "attrs",
                format!("attribute '{key}' is not an unsigned integer"),
            )),
            None => Err(Error::argument("attrs", format!("missing attribute '{key}'"))),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.entries.get(key) {
            Some(AttrValue::Bool(b)) => *b,
            _ => default,
        }
    }
}

/// Streaming factors over W, H, C, K, N.
pub type StreamingShape = [u64; 5];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pipelining {
    None,
    PipelineWeights,
    PipelineActivations,
}

/// A named node of the operator graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpDesc {
    pub name: String,
    pub kind: OpKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub attrs: AttrBag,
    /// Chosen by the strategy manager, consumed by splitting/scheduling.
    pub split_strategy: Option<SplitStrategy>,
    pub streaming: Option<StreamingShape>,
    pub spilling: bool,
    pub input_sparsity: bool,
    pub output_sparsity: bool,
    pub weights_sparsity: bool,
    pub pipelining: Pipelining,
    /// One workload list per cluster, filled by workload generation.
    pub workloads: Vec<Vec<Workload>>,
    pub wait_barriers: BTreeSet<BarrierId>,
    pub update_barriers: BTreeSet<BarrierId>,
}

impl OpDesc {
    pub fn new(name: impl Into<String>, kind: OpKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: AttrBag::default(),
            split_strategy: None,
            streaming: None,
            spilling: false,
            input_sparsity: false,
            output_sparsity: false,
            weights_sparsity: false,
            pipelining: Pipelining::None,
            workloads: Vec::new(),
            wait_barriers: BTreeSet::new(),
            update_barriers: BTreeSet::new(),
        }
    }

    pub fn op_type(&self) -> &'static str {
        match self.kind {
            OpKind::DpuTask { .. } => "DPUTask",
            OpKind::DmaTask { .. } => "DMATask",
            OpKind::UpaTask { .. } => "UPATask",
            OpKind::BarrierTask => "BarrierTask",
            OpKind::Implicit(_) => "Implicit",
            OpKind::Input => "Input",
            OpKind::Output => "Output",
            OpKind::Constant => "Constant",
        }
    }

    /// Produces work on the target.
    pub fn is_executable(&self) -> bool {
        matches!(
            self.kind,
            OpKind::DpuTask { .. } | OpKind::DmaTask { .. } | OpKind::UpaTask { .. }
        )
    }

    /// Participates in strategy selection.
    pub fn is_optimisable(&self) -> bool {
        matches!(self.kind, OpKind::DpuTask { .. } | OpKind::UpaTask { .. })
    }

    /// Pure re-indexing of data; generates no work.
    pub fn is_implicit(&self) -> bool {
        matches!(self.kind, OpKind::Implicit(_))
    }

    /// Lowerable to fixed-function DPU hardware.
    pub fn is_hardwarisable(&self) -> bool {
        matches!(self.kind, OpKind::DpuTask { .. })
    }

    pub fn is_constant_like(&self) -> bool {
        matches!(self.kind, OpKind::Constant)
    }

    pub fn dpu_task_op(&self) -> Option<DpuTaskOp> {
        match self.kind {
            OpKind::DpuTask { task_op, .. } => Some(task_op),
            _ => None,
        }
    }

    pub fn kernel(&self) -> Option<&KernelInfo> {
        match &self.kind {
            OpKind::DpuTask { kernel, .. } => Some(kernel),
            _ => None,
        }
    }

    pub fn dma_direction(&self) -> Option<DmaDirection> {
        match self.kind {
            OpKind::DmaTask { direction } => Some(direction),
            _ => None,
        }
    }
}
