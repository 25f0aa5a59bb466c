use std::collections::{BTreeMap, BTreeSet};

use log::trace;

use crate::error::{internal_error, model_error, Result};
use crate::ir::op::{Op, OpId, OpKind, OpSettings};
use crate::ir::tensor::{Tensor, TensorData, TensorId, TensorInfo, TensorKind};

/// What the host wants returned for an anchored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorReturnType {
    All,
    Final,
    EveryN(u32),
    Sum,
}

/// The dataflow graph: an arena of tensors and ops, cross-referenced by
/// id. All mutation goes through the edit primitives here so that
/// producer/consumer symmetry can never drift.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    tensors: BTreeMap<TensorId, Tensor>,
    ops: BTreeMap<OpId, Op>,
    anchors: BTreeMap<TensorId, AnchorReturnType>,
    next_op: usize,
    next_temp: usize,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---- tensor creation ----

    pub fn add_stream_input(&mut self, id: impl Into<TensorId>, info: TensorInfo) -> Result<()> {
        self.add_tensor(Tensor::new(id.into(), info, TensorKind::Stream))
    }

    pub fn add_const(
        &mut self,
        id: impl Into<TensorId>,
        info: TensorInfo,
        data: TensorData,
    ) -> Result<()> {
        let mut tensor = Tensor::new(id.into(), info, TensorKind::Const);
        if data.len() != tensor.info.nelms() {
            return Err(model_error(format!(
                "const `{}` carries {} elements for shape {:?}",
                tensor.id,
                data.len(),
                tensor.info.shape
            )));
        }
        tensor.data = Some(data);
        self.add_tensor(tensor)
    }

    pub fn add_variable(
        &mut self,
        id: impl Into<TensorId>,
        info: TensorInfo,
        data: TensorData,
    ) -> Result<()> {
        let mut tensor = Tensor::new(id.into(), info, TensorKind::Variable);
        if data.len() != tensor.info.nelms() {
            return Err(model_error(format!(
                "variable `{}` carries {} elements for shape {:?}",
                tensor.id,
                data.len(),
                tensor.info.shape
            )));
        }
        tensor.data = Some(data);
        self.add_tensor(tensor)
    }

    pub fn add_act_tensor(&mut self, id: impl Into<TensorId>, info: TensorInfo) -> Result<()> {
        self.add_tensor(Tensor::new(id.into(), info, TensorKind::ActGrad))
    }

    fn add_tensor(&mut self, tensor: Tensor) -> Result<()> {
        if self.tensors.contains_key(&tensor.id) {
            return Err(model_error(format!("tensor `{}` already exists", tensor.id)));
        }
        self.tensors.insert(tensor.id.clone(), tensor);
        Ok(())
    }

    /// Fresh tensor id derived from `base`. The counter is graph-scoped
    /// so rewrites are deterministic.
    pub fn temp_tensor_id(&mut self, base: &str) -> TensorId {
        let id = format!("t{}__{}", self.next_temp, base);
        self.next_temp += 1;
        id
    }

    // ---- lookups ----

    pub fn tensor(&self, id: &str) -> Result<&Tensor> {
        self.tensors
            .get(id)
            .ok_or_else(|| internal_error(format!("no tensor `{id}` in graph")))
    }

    pub fn tensor_mut(&mut self, id: &str) -> Result<&mut Tensor> {
        self.tensors
            .get_mut(id)
            .ok_or_else(|| internal_error(format!("no tensor `{id}` in graph")))
    }

    #[must_use]
    pub fn has_tensor(&self, id: &str) -> bool {
        self.tensors.contains_key(id)
    }

    pub fn op(&self, id: OpId) -> Result<&Op> {
        self.ops
            .get(&id)
            .ok_or_else(|| internal_error(format!("no {id} in graph")))
    }

    pub fn op_mut(&mut self, id: OpId) -> Result<&mut Op> {
        self.ops
            .get_mut(&id)
            .ok_or_else(|| internal_error(format!("no {id} in graph")))
    }

    #[must_use]
    pub fn op_ids(&self) -> Vec<OpId> {
        self.ops.keys().copied().collect()
    }

    #[must_use]
    pub fn tensor_ids(&self) -> Vec<TensorId> {
        self.tensors.keys().cloned().collect()
    }

    #[must_use]
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Ops of a given type, in id order. Convenient in tests and in the
    /// transforms.
    #[must_use]
    pub fn ops_of_type(&self, type_name: &str) -> Vec<OpId> {
        self.ops
            .values()
            .filter(|op| op.type_name() == type_name)
            .map(|op| op.id)
            .collect()
    }

    // ---- op creation and wiring ----

    /// Create an op, wire `inputs` at indices `0..`, run setup and
    /// create its output tensors under the given ids.
    pub fn create_op(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
        outputs: &[TensorId],
        settings: OpSettings,
    ) -> Result<OpId> {
        let id = OpId(self.next_op);
        self.next_op += 1;
        self.ops.insert(id, Op::new(id, kind, settings));

        for (index, tensor_id) in inputs.iter().enumerate() {
            self.connect_in(id, index, tensor_id)?;
        }

        let out_infos = self.infer_out_infos(id)?;
        if out_infos.len() != outputs.len() {
            let op = self.op(id)?;
            return Err(internal_error(format!(
                "{} produces {} outputs, {} ids supplied",
                op.debug_name(),
                out_infos.len(),
                outputs.len()
            )));
        }
        for (index, (tensor_id, info)) in outputs.iter().zip(out_infos).enumerate() {
            self.add_act_tensor(tensor_id.clone(), info)?;
            self.connect_out(id, index, tensor_id)?;
        }
        trace!("created {}", self.op(id)?.debug_name());
        Ok(id)
    }

    /// Like `create_op`, but wires existing producer-free tensors as
    /// the outputs instead of creating new ones. Used by rewrites that
    /// replace an op while keeping its output tensors alive.
    pub fn attach_op(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
        outputs: &[TensorId],
        settings: OpSettings,
    ) -> Result<OpId> {
        let id = OpId(self.next_op);
        self.next_op += 1;
        self.ops.insert(id, Op::new(id, kind, settings));
        for (index, tensor_id) in inputs.iter().enumerate() {
            self.connect_in(id, index, tensor_id)?;
        }
        for (index, tensor_id) in outputs.iter().enumerate() {
            self.connect_out(id, index, tensor_id)?;
        }
        self.setup_op(id)?;
        Ok(id)
    }

    pub fn connect_in(&mut self, op_id: OpId, index: usize, tensor_id: &str) -> Result<()> {
        if !self.has_tensor(tensor_id) {
            return Err(internal_error(format!(
                "connect_in: no tensor `{tensor_id}` in graph"
            )));
        }
        let op = self.op_mut(op_id)?;
        if op.inputs.contains_key(&index) {
            return Err(internal_error(format!(
                "connect_in: input {index} of {op_id} already connected"
            )));
        }
        op.inputs.insert(index, tensor_id.to_string());
        self.tensor_mut(tensor_id)?
            .consumers
            .entry(op_id)
            .or_default()
            .push(index);
        Ok(())
    }

    pub fn connect_out(&mut self, op_id: OpId, index: usize, tensor_id: &str) -> Result<()> {
        let producer = self.tensor(tensor_id)?.producer;
        if let Some(existing) = producer {
            return Err(internal_error(format!(
                "connect_out: tensor `{tensor_id}` already produced by {existing}"
            )));
        }
        let op = self.op_mut(op_id)?;
        if op.outputs.contains_key(&index) {
            return Err(internal_error(format!(
                "connect_out: output {index} of {op_id} already connected"
            )));
        }
        op.outputs.insert(index, tensor_id.to_string());
        self.tensor_mut(tensor_id)?.producer = Some(op_id);
        Ok(())
    }

    pub fn disconnect_in(&mut self, op_id: OpId, index: usize) -> Result<()> {
        let tensor_id = self
            .op_mut(op_id)?
            .inputs
            .remove(&index)
            .ok_or_else(|| internal_error(format!("disconnect_in: input {index} of {op_id} not connected")))?;
        let tensor = self.tensor_mut(&tensor_id)?;
        if let Some(indices) = tensor.consumers.get_mut(&op_id) {
            indices.retain(|i| *i != index);
            if indices.is_empty() {
                tensor.consumers.remove(&op_id);
            }
        }
        Ok(())
    }

    pub fn disconnect_out(&mut self, op_id: OpId, index: usize) -> Result<()> {
        let tensor_id = self
            .op_mut(op_id)?
            .outputs
            .remove(&index)
            .ok_or_else(|| internal_error(format!("disconnect_out: output {index} of {op_id} not connected")))?;
        self.tensor_mut(&tensor_id)?.producer = None;
        Ok(())
    }

    pub fn disconnect_all_inputs(&mut self, op_id: OpId) -> Result<()> {
        let indices: Vec<usize> = self.op(op_id)?.inputs.keys().copied().collect();
        for index in indices {
            self.disconnect_in(op_id, index)?;
        }
        Ok(())
    }

    pub fn disconnect_all_outputs(&mut self, op_id: OpId) -> Result<()> {
        let indices: Vec<usize> = self.op(op_id)?.outputs.keys().copied().collect();
        for index in indices {
            self.disconnect_out(op_id, index)?;
        }
        Ok(())
    }

    /// Remove a fully disconnected op from the arena.
    pub fn erase_op(&mut self, op_id: OpId) -> Result<()> {
        let op = self.op(op_id)?;
        if !op.inputs.is_empty() || !op.outputs.is_empty() {
            return Err(internal_error(format!(
                "erase_op: {} is still connected",
                op.debug_name()
            )));
        }
        self.ops.remove(&op_id);
        Ok(())
    }

    /// Remove a tensor with no producer and no consumers.
    pub fn remove_tensor(&mut self, id: &str) -> Result<()> {
        let tensor = self.tensor(id)?;
        if tensor.producer.is_some() || !tensor.consumers.is_empty() {
            return Err(internal_error(format!(
                "remove_tensor: `{id}` is still referenced"
            )));
        }
        self.anchors.remove(id);
        self.tensors.remove(id);
        Ok(())
    }

    // ---- setup ----

    /// Input infos of an op in connection-index order. Indices must be
    /// dense from zero.
    pub fn in_infos(&self, op_id: OpId) -> Result<Vec<TensorInfo>> {
        let op = self.op(op_id)?;
        let mut infos = Vec::with_capacity(op.inputs.len());
        for (expected, (index, tensor_id)) in op.inputs.iter().enumerate() {
            if *index != expected {
                return Err(internal_error(format!(
                    "{} has a gap in its input indices",
                    op.debug_name()
                )));
            }
            infos.push(self.tensor(tensor_id)?.info.clone());
        }
        Ok(infos)
    }

    fn infer_out_infos(&self, op_id: OpId) -> Result<Vec<TensorInfo>> {
        let ins = self.in_infos(op_id)?;
        let op = self.op(op_id)?;
        op.kind.out_infos(&ins)
    }

    /// Recompute and store the output infos of an op. Idempotent; called
    /// after rewiring.
    pub fn setup_op(&mut self, op_id: OpId) -> Result<()> {
        let out_infos = self.infer_out_infos(op_id)?;
        let outputs: Vec<(usize, TensorId)> = self
            .op(op_id)?
            .outputs
            .iter()
            .map(|(i, t)| (*i, t.clone()))
            .collect();
        for (index, tensor_id) in outputs {
            let info = out_infos.get(index).ok_or_else(|| {
                internal_error(format!("setup_op: {op_id} has no output info {index}"))
            })?;
            self.tensor_mut(&tensor_id)?.info = info.clone();
        }
        Ok(())
    }

    // ---- anchors ----

    pub fn set_anchor(&mut self, id: &str, art: AnchorReturnType) -> Result<()> {
        if !self.has_tensor(id) {
            return Err(model_error(format!("cannot anchor unknown tensor `{id}`")));
        }
        self.anchors.insert(id.to_string(), art);
        Ok(())
    }

    #[must_use]
    pub fn is_anchored(&self, id: &str) -> bool {
        self.anchors.contains_key(id)
    }

    #[must_use]
    pub fn anchors(&self) -> &BTreeMap<TensorId, AnchorReturnType> {
        &self.anchors
    }

    // ---- traversal ----

    /// Deterministic topological order over ops (Kahn's algorithm, ties
    /// broken by op id). Errors on a cycle.
    pub fn topo_order(&self) -> Result<Vec<OpId>> {
        let mut in_degree: BTreeMap<OpId, usize> = BTreeMap::new();
        for op in self.ops.values() {
            let mut degree = 0;
            for tensor_id in op.inputs.values() {
                if self.tensor(tensor_id)?.producer.is_some() {
                    degree += 1;
                }
            }
            in_degree.insert(op.id, degree);
        }

        let mut ready: BTreeSet<OpId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.ops.len());

        while let Some(next) = ready.iter().next().copied() {
            ready.remove(&next);
            order.push(next);
            for tensor_id in self.op(next)?.outputs.values() {
                for (consumer, indices) in &self.tensor(tensor_id)?.consumers {
                    let entry = in_degree
                        .get_mut(consumer)
                        .ok_or_else(|| internal_error(format!("no {consumer} in graph")))?;
                    *entry = entry.saturating_sub(indices.len());
                    if *entry == 0 {
                        ready.insert(*consumer);
                    }
                }
            }
        }

        if order.len() != self.ops.len() {
            return Err(internal_error("graph contains a cycle"));
        }
        Ok(order)
    }

    // ---- verification ----

    /// Structural invariants: id resolution, producer/consumer symmetry,
    /// acyclicity and setup idempotency.
    pub fn verify(&self) -> Result<()> {
        for op in self.ops.values() {
            for (index, tensor_id) in &op.inputs {
                let tensor = self.tensor(tensor_id)?;
                let indices = tensor.consumers.get(&op.id).ok_or_else(|| {
                    internal_error(format!(
                        "{} reads `{tensor_id}` but is not registered as a consumer",
                        op.debug_name()
                    ))
                })?;
                if !indices.contains(index) {
                    return Err(internal_error(format!(
                        "{} input {index} missing from `{tensor_id}` consumer indices",
                        op.debug_name()
                    )));
                }
            }
            for tensor_id in op.outputs.values() {
                let tensor = self.tensor(tensor_id)?;
                if tensor.producer != Some(op.id) {
                    return Err(internal_error(format!(
                        "`{tensor_id}` does not record {} as its producer",
                        op.debug_name()
                    )));
                }
            }
        }
        for tensor in self.tensors.values() {
            if let Some(producer) = tensor.producer {
                let op = self.op(producer)?;
                if !op.outputs.values().any(|t| *t == tensor.id) {
                    return Err(internal_error(format!(
                        "`{}` claims producer {} which does not output it",
                        tensor.id,
                        op.debug_name()
                    )));
                }
            }
            for (consumer, indices) in &tensor.consumers {
                let op = self.op(*consumer)?;
                for index in indices {
                    if op.input_id(*index) != Some(&tensor.id) {
                        return Err(internal_error(format!(
                            "`{}` consumer entry ({}, {index}) is stale",
                            tensor.id,
                            op.debug_name()
                        )));
                    }
                }
            }
        }
        // Also checks acyclicity.
        let order = self.topo_order()?;
        for op_id in order {
            let stored: Vec<TensorInfo> = self
                .op(op_id)?
                .outputs
                .values()
                .map(|t| self.tensor(t).map(|tensor| tensor.info.clone()))
                .collect::<Result<_>>()?;
            let fresh = self.infer_out_infos(op_id)?;
            if stored != fresh {
                return Err(internal_error(format!(
                    "{} output infos are stale",
                    self.op(op_id)?.debug_name()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tensor::DType;

    fn f32_info(shape: &[usize]) -> TensorInfo {
        TensorInfo::new(DType::F32, shape.to_vec())
    }

    fn diamond() -> Graph {
        let mut graph = Graph::new();
        graph
            .add_stream_input("x", f32_info(&[2, 2]))
            .expect("tensor add must succeed");
        graph
            .create_op(
                OpKind::Relu,
                &["x".to_string()],
                &["r".to_string()],
                OpSettings::default(),
            )
            .expect("op create must succeed");
        graph
            .create_op(
                OpKind::Scale { factor: 2.0 },
                &["r".to_string()],
                &["s".to_string()],
                OpSettings::default(),
            )
            .expect("op create must succeed");
        graph
            .create_op(
                OpKind::Add,
                &["r".to_string(), "s".to_string()],
                &["y".to_string()],
                OpSettings::default(),
            )
            .expect("op create must succeed");
        graph
    }

    #[test]
    fn create_op_wires_producers_and_consumers() {
        let graph = diamond();
        graph.verify().expect("verify must pass");

        let r = graph.tensor("r").expect("tensor must exist");
        assert!(r.producer.is_some());
        assert_eq!(r.consumers.len(), 2);
    }

    #[test]
    fn topo_order_respects_data_dependencies() {
        let graph = diamond();
        let order = graph.topo_order().expect("topo order must exist");
        assert_eq!(order.len(), 3);
        let pos = |id: OpId| order.iter().position(|o| *o == id).expect("op in order");
        assert!(pos(OpId(0)) < pos(OpId(1)));
        assert!(pos(OpId(1)) < pos(OpId(2)));
    }

    #[test]
    fn erase_refuses_connected_ops() {
        let mut graph = diamond();
        let err = graph.erase_op(OpId(0)).expect_err("erase must fail");
        assert!(err.to_string().contains("still connected"));

        graph
            .disconnect_all_inputs(OpId(2))
            .expect("disconnect must succeed");
        graph
            .disconnect_all_outputs(OpId(2))
            .expect("disconnect must succeed");
        graph.erase_op(OpId(2)).expect("erase must succeed");
        assert_eq!(graph.op_count(), 2);
    }

    #[test]
    fn stale_output_infos_fail_verification() {
        let mut graph = diamond();
        graph
            .tensor_mut("y")
            .expect("tensor must exist")
            .info
            .shape = vec![9, 9];
        let err = graph.verify().expect_err("verify must fail");
        assert!(err.to_string().contains("stale"));
    }

    #[test]
    fn temp_ids_are_unique_and_traceable() {
        let mut graph = Graph::new();
        assert_eq!(graph.temp_tensor_id("x"), "t0__x");
        assert_eq!(graph.temp_tensor_id("x"), "t1__x");
    }

    #[test]
    fn anchoring_unknown_tensors_is_a_model_error() {
        let mut graph = Graph::new();
        let err = graph
            .set_anchor("nope", AnchorReturnType::All)
            .expect_err("anchor must fail");
        assert_eq!(err.category(), crate::error::ErrorCategory::Model);
    }
}
