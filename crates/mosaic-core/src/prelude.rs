//! Convenience re-exports for downstream crates.

pub use crate::barrier::Barrier;
pub use crate::config::GlobalConfig;
pub use crate::dtype::DType;
pub use crate::error::{Error, Result};
pub use crate::id::{BarrierId, OpId, TensorId};
pub use crate::model::ComputationModel;
pub use crate::op::{
    DmaDirection, DpuTaskOp, ImplicitKind, KernelInfo, OpDesc, OpKind, Pipelining,
};
pub use crate::quant::QuantParams;
pub use crate::shape::{Order, Shape};
pub use crate::target::{Device, Revision, TargetDescriptor};
pub use crate::tensor::{
    MemoryLocation, OverwriteStrategy, SplitStrategy, SubTensor, TensorDesc,
};
pub use crate::workload::{MpeMode, Workload};
