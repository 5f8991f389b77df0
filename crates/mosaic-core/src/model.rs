//! The computation model: an arena of ops and tensors with stable handles.
//!
//! The model exclusively owns every op and tensor for the whole compilation.
//! Passes traverse through parent/child queries on the handles and never
//! store references across pass boundaries.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::error::{Error, Result};
use crate::id::{OpId, TensorId};
use crate::op::{OpDesc, OpKind};
use crate::tensor::TensorDesc;

/// Record of a removed data flow so a pass can restore it verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub tensor: TensorId,
    pub sink: OpId,
    pub input_slot: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputationModel {
    ops: Vec<OpDesc>,
    tensors: Vec<TensorDesc>,
    /// Producing op of each tensor, parallel to `tensors`.
    sources: Vec<Option<OpId>>,
}

impl ComputationModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tensor(&mut self, desc: TensorDesc) -> TensorId {
        let id = TensorId::new(self.tensors.len() as u32);
        self.tensors.push(desc);
        self.sources.push(None);
        id
    }

    pub fn add_op(&mut self, mut desc: OpDesc) -> OpId {
        let id = OpId::new(self.ops.len() as u32);
        for &out in &desc.outputs {
            self.sources[out.index()] = Some(id);
        }
        desc.outputs.dedup();
        self.ops.push(desc);
        id
    }

    pub fn op(&self, id: OpId) -> &OpDesc {
        &self.ops[id.index()]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut OpDesc {
        &mut self.ops[id.index()]
    }

    pub fn tensor(&self, id: TensorId) -> &TensorDesc {
        &self.tensors[id.index()]
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut TensorDesc {
        &mut self.tensors[id.index()]
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn op_ids(&self) -> impl Iterator<Item = OpId> + '_ {
        (0..self.ops.len() as u32).map(OpId::new)
    }

    pub fn tensor_ids(&self) -> impl Iterator<Item = TensorId> + '_ {
        (0..self.tensors.len() as u32).map(TensorId::new)
    }

    pub fn op_by_name(&self, name: &str) -> Option<OpId> {
        self.op_ids().find(|&id| self.op(id).name == name)
    }

    /// The op producing `tensor`, if any (graph inputs have none).
    pub fn source_op(&self, tensor: TensorId) -> Option<OpId> {
        self.sources[tensor.index()]
    }

    /// Ops consuming `tensor`, in arena order.
    pub fn sink_ops(&self, tensor: TensorId) -> Vec<OpId> {
        self.op_ids()
            .filter(|&id| self.op(id).inputs.contains(&tensor))
            .collect()
    }

    /// Producing ops of `op`'s inputs, deduplicated, in input-slot order.
    pub fn parents(&self, op: OpId) -> Vec<OpId> {
        let mut out = Vec::new();
        for &t in &self.op(op).inputs {
            if let Some(src) = self.source_op(t) {
                if !out.contains(&src) {
                    out.push(src);
                }
            }
        }
        out
    }

    /// Consuming ops of `op`'s outputs, deduplicated, in arena order.
    pub fn children(&self, op: OpId) -> Vec<OpId> {
        let mut out = Vec::new();
        for &t in &self.op(op).outputs {
            for sink in self.sink_ops(t) {
                if !out.contains(&sink) {
                    out.push(sink);
                }
            }
        }
        out
    }

    /// Parents excluding constant-like nodes; the strategy solver walks the
    /// activation graph only.
    pub fn data_parents(&self, op: OpId) -> Vec<OpId> {
        self.parents(op)
            .into_iter()
            .filter(|&p| !self.op(p).is_constant_like())
            .collect()
    }

    /// Swap one of `op`'s outputs, keeping producer tracking consistent.
    pub fn rebind_output(&mut self, op: OpId, old: TensorId, new: TensorId) {
        for t in self.ops[op.index()].outputs.iter_mut() {
            if *t == old {
                *t = new;
            }
        }
        if self.sources[old.index()] == Some(op) {
            self.sources[old.index()] = None;
        }
        self.sources[new.index()] = Some(op);
    }

    /// Connect `tensor` as a new trailing input of `sink`.
    pub fn define_flow(&mut self, tensor: TensorId, sink: OpId) -> FlowRecord {
        let slot = self.ops[sink.index()].inputs.len();
        self.ops[sink.index()].inputs.push(tensor);
        FlowRecord {
            tensor,
            sink,
            input_slot: slot,
        }
    }

    /// Restore a flow removed by `undefine_flow` at its original slot.
    pub fn restore_flow(&mut self, record: FlowRecord) {
        let inputs = &mut self.ops[record.sink.index()].inputs;
        let slot = record.input_slot.min(inputs.len());
        inputs.insert(slot, record.tensor);
    }

    /// Remove the flow `tensor -> sink`, returning what is needed to undo it.
    pub fn undefine_flow(&mut self, tensor: TensorId, sink: OpId) -> Result<FlowRecord> {
        let slot = self.ops[sink.index()]
            .inputs
            .iter()
            .position(|&t| t == tensor)
            .ok_or_else(|| {
                Error::logic(
                    "model",
                    format!(
                        "no flow from {} into '{}'",
                        tensor,
                        self.ops[sink.index()].name
                    ),
                )
            })?;
        self.ops[sink.index()].inputs.remove(slot);
        Ok(FlowRecord {
            tensor,
            sink,
            input_slot: slot,
        })
    }

    pub fn input_ops(&self) -> Vec<OpId> {
        self.op_ids()
            .filter(|&id| matches!(self.op(id).kind, OpKind::Input))
            .collect()
    }

    pub fn output_ops(&self) -> Vec<OpId> {
        self.op_ids()
            .filter(|&id| matches!(self.op(id).kind, OpKind::Output))
            .collect()
    }

    /// Kahn topological order over all ops; deterministic (ready set drained
    /// in arena order). Errors with the name of an op on a cycle.
    pub fn topological_order(&self) -> Result<Vec<OpId>> {
        let mut in_degree: HashMap<OpId, usize> = HashMap::new();
        for id in self.op_ids() {
            in_degree.insert(id, self.parents(id).len());
        }

        let mut queue: VecDeque<OpId> = self
            .op_ids()
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.ops.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for child in self.children(id) {
                let deg = in_degree.get_mut(&child).ok_or_else(|| {
                    Error::logic("model", format!("unknown child {child} during sort"))
                })?;
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(child);
                }
            }
        }

        if order.len() != self.ops.len() {
            let stuck = self
                .op_ids()
                .find(|id| !order.contains(id))
                .map(|id| self.op(id).name.clone())
                .unwrap_or_default();
            return Err(Error::runtime(
                "model",
                format!("operator graph contains a cycle through '{stuck}'"),
            ));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::shape::Shape;

    fn tensor(model: &mut ComputationModel, name: &str) -> TensorId {
        model.add_tensor(TensorDesc::new(name, Shape::new(8, 8, 16, 1), DType::U8))
    }

    #[test]
    fn flows_and_topology() {
        let mut m = ComputationModel::new();
        let t0 = tensor(&mut m, "t0");
        let t1 = tensor(&mut m, "t1");

        let mut input = OpDesc::new("input", OpKind::Input);
        input.outputs.push(t0);
        let input = m.add_op(input);

        let mut relu = OpDesc::new("relu", OpKind::UpaTask {
            kernel_name: "relu".into(),
        });
        relu.inputs.push(t0);
        relu.outputs.push(t1);
        let relu = m.add_op(relu);

        let mut output = OpDesc::new("output", OpKind::Output);
        output.inputs.push(t1);
        let output = m.add_op(output);

        assert_eq!(m.source_op(t1), Some(relu));
        assert_eq!(m.sink_ops(t0), vec![relu]);
        assert_eq!(m.parents(output), vec![relu]);
        assert_eq!(m.topological_order().unwrap(), vec![input, relu, output]);

        let rec = m.undefine_flow(t0, relu).unwrap();
        assert!(m.op(relu).inputs.is_empty());
        m.restore_flow(rec);
        assert_eq!(m.op(relu).inputs, vec![t0]);
    }
}
