//! Reverse-mode gradient growth.
//!
//! Walking the forward ops in reverse topological order, each op
//! declares how its gradients are computed through [`GradOpDef`]s. A
//! def names its inputs symbolically (forward input, forward output, or
//! gradient of a forward output) and the wiring here resolves those
//! tags against concrete tensors, summing partial gradients where a
//! forward tensor fans out.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::error::{CompileError, Result};
use crate::ir::graph::Graph;
use crate::ir::op::{Op, OpId, OpKind, OpSettings, Phase};
use crate::ir::tensor::{TensorData, TensorId, TensorInfo};

/// Where a gradient op's input comes from, relative to the forward op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradOpInType {
    /// Forward input at `fwd_index`.
    In,
    /// Forward output at `fwd_index`.
    Out,
    /// Gradient of the forward output at `fwd_index`.
    GradOut,
}

#[derive(Debug, Clone, Copy)]
pub struct GradInOutMapper {
    pub grad_in: usize,
    pub fwd_index: usize,
    pub ty: GradOpInType,
}

impl GradInOutMapper {
    #[must_use]
    pub fn new(grad_in: usize, fwd_index: usize, ty: GradOpInType) -> Self {
        Self {
            grad_in,
            fwd_index,
            ty,
        }
    }
}

/// One gradient op to instantiate for a forward op. `out_to_nongrad_in`
/// maps the grad op's output indices to the forward input indices whose
/// gradients they produce.
#[derive(Debug, Clone)]
pub struct GradOpDef {
    pub kind: OpKind,
    pub inputs: Vec<GradInOutMapper>,
    pub out_to_nongrad_in: BTreeMap<usize, usize>,
}

impl GradOpDef {
    fn unary(kind: OpKind, input: GradInOutMapper, nongrad_in: usize) -> Self {
        Self {
            kind,
            inputs: vec![input],
            out_to_nongrad_in: BTreeMap::from([(0, nongrad_in)]),
        }
    }
}

/// Gradient op synthesis for one forward op. Kinds without gradients
/// are a model error that names the offending op.
pub fn grad_defs(graph: &Graph, op: &Op) -> Result<Vec<GradOpDef>> {
    use GradOpInType::{GradOut, In, Out};
    let gout = |i: usize| GradInOutMapper::new(0, i, GradOut);

    match &op.kind {
        OpKind::Add | OpKind::Sum => {
            // Identity partials; broadcast collapse happens when the
            // partials are finalized.
            Ok((0..op.inputs.len())
                .map(|i| GradOpDef::unary(OpKind::Identity, gout(0), i))
                .collect())
        }
        OpKind::Mul => Ok(vec![
            GradOpDef {
                kind: OpKind::Mul,
                inputs: vec![gout(0), GradInOutMapper::new(1, 1, In)],
                out_to_nongrad_in: BTreeMap::from([(0, 0)]),
            },
            GradOpDef {
                kind: OpKind::Mul,
                inputs: vec![gout(0), GradInOutMapper::new(1, 0, In)],
                out_to_nongrad_in: BTreeMap::from([(0, 1)]),
            },
        ]),
        OpKind::Scale { factor } => Ok(vec![GradOpDef::unary(
            OpKind::Scale { factor: *factor },
            gout(0),
            0,
        )]),
        OpKind::MatMul => Ok(vec![
            GradOpDef {
                kind: OpKind::MatMulLhsGrad,
                inputs: vec![gout(0), GradInOutMapper::new(1, 1, In)],
                out_to_nongrad_in: BTreeMap::from([(0, 0)]),
            },
            GradOpDef {
                kind: OpKind::MatMulRhsGrad,
                inputs: vec![GradInOutMapper::new(0, 0, In), GradInOutMapper::new(1, 0, GradOut)],
                out_to_nongrad_in: BTreeMap::from([(0, 1)]),
            },
        ]),
        OpKind::Relu => Ok(vec![GradOpDef {
            kind: OpKind::ReluGrad,
            inputs: vec![gout(0), GradInOutMapper::new(1, 0, Out)],
            out_to_nongrad_in: BTreeMap::from([(0, 0)]),
        }]),
        OpKind::Exp => Ok(vec![GradOpDef {
            // d/dx exp(x) = exp(x), which is the forward output.
            kind: OpKind::Mul,
            inputs: vec![gout(0), GradInOutMapper::new(1, 0, Out)],
            out_to_nongrad_in: BTreeMap::from([(0, 0)]),
        }]),
        OpKind::Identity => Ok(vec![GradOpDef::unary(OpKind::Identity, gout(0), 0)]),
        OpKind::Slice { slices } => {
            let in_shape = &graph.in_infos(op.id)?[0].shape;
            let lower: Vec<usize> = slices.iter().map(|(lo, _)| *lo).collect();
            let upper: Vec<usize> = slices
                .iter()
                .zip(in_shape)
                .map(|((_, up), dim)| dim - up)
                .collect();
            Ok(vec![GradOpDef::unary(
                OpKind::Pad { lower, upper },
                gout(0),
                0,
            )])
        }
        OpKind::Pad { lower, .. } => {
            let in_shape = &graph.in_infos(op.id)?[0].shape;
            let slices = lower
                .iter()
                .zip(in_shape)
                .map(|(lo, dim)| (*lo, lo + dim))
                .collect();
            Ok(vec![GradOpDef::unary(OpKind::Slice { slices }, gout(0), 0)])
        }
        OpKind::Concat { axis } => {
            let in_infos = graph.in_infos(op.id)?;
            let out_id = op.output_id(0).ok_or_else(|| {
                crate::error::internal_error(format!("{} has no output 0", op.debug_name()))
            })?;
            let out_shape = graph.tensor(out_id)?.info.shape.clone();
            let mut defs = Vec::with_capacity(in_infos.len());
            let mut offset = 0;
            for (i, info) in in_infos.iter().enumerate() {
                let len = info.shape[*axis];
                let slices = out_shape
                    .iter()
                    .enumerate()
                    .map(|(d, dim)| {
                        if d == *axis {
                            (offset, offset + len)
                        } else {
                            (0, *dim)
                        }
                    })
                    .collect();
                defs.push(GradOpDef::unary(OpKind::Slice { slices }, gout(0), i));
                offset += len;
            }
            Ok(defs)
        }
        OpKind::L1Loss { lambda } => Ok(vec![GradOpDef::unary(
            OpKind::L1Grad { lambda: *lambda },
            GradInOutMapper::new(0, 0, In),
            0,
        )]),
        _ => Err(CompileError::NoGradImpl {
            op_type: op.type_name().to_string(),
            name: op.debug_name(),
        }),
    }
}

/// Forward tensor to the tensor holding its finalized gradient.
#[derive(Debug, Default, Clone)]
pub struct Gradients {
    map: BTreeMap<TensorId, TensorId>,
}

impl Gradients {
    #[must_use]
    pub fn get(&self, forward: &str) -> Option<&TensorId> {
        self.map.get(forward)
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = (&TensorId, &TensorId)> {
        self.map.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Ops from which `target` is reachable, the loss producer included.
fn ancestors(graph: &Graph, target: &str) -> Result<BTreeSet<OpId>> {
    let mut set = BTreeSet::new();
    let mut stack: Vec<OpId> = match graph.tensor(target)?.producer {
        Some(p) => vec![p],
        None => Vec::new(),
    };
    while let Some(op_id) = stack.pop() {
        if !set.insert(op_id) {
            continue;
        }
        for tensor_id in graph.op(op_id)?.inputs.values() {
            if let Some(producer) = graph.tensor(tensor_id)?.producer {
                stack.push(producer);
            }
        }
    }
    Ok(set)
}

/// Grow the backward pass for `loss`. Every op the loss depends on gets
/// its gradient ops instantiated; the returned map resolves forward
/// tensors to their finalized gradients.
pub fn grow_backward(graph: &mut Graph, loss: &str) -> Result<Gradients> {
    let path = ancestors(graph, loss)?;
    let order: Vec<OpId> = graph
        .topo_order()?
        .into_iter()
        .rev()
        .filter(|id| path.contains(id))
        .collect();

    // Seed: d loss / d loss = 1.
    let loss_info = graph.tensor(loss)?.info.clone();
    let seed_id = graph.temp_tensor_id(&format!("grad_{loss}_seed"));
    graph.add_const(
        seed_id.clone(),
        loss_info.clone(),
        TensorData::F32(vec![1.0; loss_info.nelms()]),
    )?;

    let mut partials: BTreeMap<TensorId, Vec<TensorId>> = BTreeMap::new();
    partials.insert(loss.to_string(), vec![seed_id]);
    let mut finalized = Gradients::default();

    for op_id in order {
        let op = graph.op(op_id)?.clone();
        let mut grad_of_out: BTreeMap<usize, TensorId> = BTreeMap::new();
        for (index, tensor_id) in &op.outputs {
            if let Some(parts) = partials.remove(tensor_id) {
                let grad = finalize_partials(graph, tensor_id, parts, &op.settings)?;
                finalized.map.insert(tensor_id.clone(), grad.clone());
                grad_of_out.insert(*index, grad);
            }
        }
        if grad_of_out.is_empty() {
            continue;
        }

        for def in grad_defs(graph, &op)? {
            let mut inputs: Vec<TensorId> = Vec::with_capacity(def.inputs.len());
            let mut missing_grad = false;
            let mut mappers = def.inputs.clone();
            mappers.sort_by_key(|m| m.grad_in);
            for mapper in &mappers {
                let resolved = match mapper.ty {
                    GradOpInType::In => op.input_id(mapper.fwd_index).cloned(),
                    GradOpInType::Out => op.output_id(mapper.fwd_index).cloned(),
                    GradOpInType::GradOut => grad_of_out.get(&mapper.fwd_index).cloned(),
                };
                match resolved {
                    Some(id) => inputs.push(id),
                    None => {
                        missing_grad = true;
                        break;
                    }
                }
            }
            // A def whose required output gradient never materialized
            // belongs to a branch that does not reach the loss.
            if missing_grad {
                continue;
            }

            let mut outputs = Vec::with_capacity(def.out_to_nongrad_in.len());
            let mut targets = Vec::with_capacity(def.out_to_nongrad_in.len());
            for nongrad_in in def.out_to_nongrad_in.values() {
                let fwd_in = op.input_id(*nongrad_in).cloned().ok_or_else(|| {
                    crate::error::internal_error(format!(
                        "{} has no input {nongrad_in} for gradient wiring",
                        op.debug_name()
                    ))
                })?;
                outputs.push(graph.temp_tensor_id(&format!("grad_{fwd_in}")));
                targets.push(fwd_in);
            }

            let settings = OpSettings {
                name: format!("{}_grad", op.settings.name),
                phase: Phase::Backward,
                vgraph: op.settings.vgraph,
                pipeline_stage: op.settings.pipeline_stage,
                recompute: Default::default(),
            };
            graph.create_op(def.kind.clone(), &inputs, &outputs, settings)?;

            for (partial, target) in outputs.into_iter().zip(targets) {
                partials.entry(target).or_default().push(partial);
            }
        }
        debug!("grew gradients for {}", op.debug_name());
    }

    // Leaf tensors (variables, stream inputs) have no producer on the
    // path; finalize whatever partials they accumulated.
    let leftover: Vec<TensorId> = partials.keys().cloned().collect();
    for tensor_id in leftover {
        if let Some(parts) = partials.remove(&tensor_id) {
            let settings = OpSettings::named(format!("{tensor_id}_grad_final"));
            let grad = finalize_partials(graph, &tensor_id, parts, &settings)?;
            finalized.map.insert(tensor_id, grad);
        }
    }
    Ok(finalized)
}

/// Collapse a tensor's partial gradients into one: unbroadcast each to
/// the forward shape, then sum if more than one remains.
fn finalize_partials(
    graph: &mut Graph,
    forward: &str,
    parts: Vec<TensorId>,
    settings: &OpSettings,
) -> Result<TensorId> {
    let fwd_info = graph.tensor(forward)?.info.clone();
    let mut shaped = Vec::with_capacity(parts.len());
    for part in parts {
        shaped.push(unbroadcast(graph, &part, &fwd_info, settings)?);
    }
    if shaped.len() == 1 {
        return Ok(shaped.into_iter().next().ok_or_else(|| {
            crate::error::internal_error(format!("tensor `{forward}` has no partial gradients"))
        })?);
    }
    let out = graph.temp_tensor_id(&format!("grad_{forward}"));
    let sum_settings = OpSettings {
        name: format!("{}_grad_sum", settings.name),
        phase: Phase::Backward,
        vgraph: settings.vgraph,
        pipeline_stage: settings.pipeline_stage,
        recompute: Default::default(),
    };
    graph.create_op(OpKind::Sum, &shaped, &[out.clone()], sum_settings)?;
    Ok(out)
}

/// Insert a `ReduceSumTo` when a partial gradient carries the broadcast
/// shape instead of the forward tensor's shape.
fn unbroadcast(
    graph: &mut Graph,
    part: &str,
    fwd_info: &TensorInfo,
    settings: &OpSettings,
) -> Result<TensorId> {
    if graph.tensor(part)?.info.shape == fwd_info.shape {
        return Ok(part.to_string());
    }
    let out = graph.temp_tensor_id(&format!("{part}_reduced"));
    let reduce_settings = OpSettings {
        name: format!("{}_unbroadcast", settings.name),
        phase: Phase::Backward,
        vgraph: settings.vgraph,
        pipeline_stage: settings.pipeline_stage,
        recompute: Default::default(),
    };
    graph.create_op(
        OpKind::ReduceSumTo {
            shape: fwd_info.shape.clone(),
        },
        &[part.to_string()],
        &[out.clone()],
        reduce_settings,
    )?;
    Ok(out)
}

/// One `SgdVarUpdate` per trainable variable that received a gradient.
pub fn apply_sgd(graph: &mut Graph, gradients: &Gradients, lr: f32) -> Result<Vec<OpId>> {
    let mut updates = Vec::new();
    for id in graph.tensor_ids() {
        if graph.tensor(&id)?.kind != crate::ir::tensor::TensorKind::Variable {
            continue;
        }
        let Some(grad) = gradients.get(&id).cloned() else {
            continue;
        };
        let out = graph.temp_tensor_id(&format!("{id}_updated"));
        let settings = OpSettings {
            name: format!("{id}_sgd"),
            phase: Phase::Backward,
            ..OpSettings::default()
        };
        let op_id = graph.create_op(
            OpKind::SgdVarUpdate { lr },
            &[id.clone(), grad],
            &[out],
            settings,
        )?;
        updates.push(op_id);
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tensor::DType;

    fn f32_info(shape: &[usize]) -> TensorInfo {
        TensorInfo::new(DType::F32, shape.to_vec())
    }

    fn train_graph() -> Graph {
        // x -> MatMul(w) -> Relu -> L1Loss
        let mut graph = Graph::new();
        graph
            .add_stream_input("x", f32_info(&[2, 3]))
            .expect("tensor add must succeed");
        graph
            .add_variable(
                "w",
                f32_info(&[3, 2]),
                TensorData::F32(vec![0.5; 6]),
            )
            .expect("tensor add must succeed");
        graph
            .create_op(
                OpKind::MatMul,
                &["x".to_string(), "w".to_string()],
                &["mm".to_string()],
                OpSettings::named("mm"),
            )
            .expect("op create must succeed");
        graph
            .create_op(
                OpKind::Relu,
                &["mm".to_string()],
                &["act".to_string()],
                OpSettings::named("act"),
            )
            .expect("op create must succeed");
        graph
            .create_op(
                OpKind::L1Loss { lambda: 0.1 },
                &["act".to_string()],
                &["loss".to_string()],
                OpSettings::named("loss"),
            )
            .expect("op create must succeed");
        graph
    }

    #[test]
    fn backward_pass_reaches_the_variable() {
        let mut graph = train_graph();
        let grads = grow_backward(&mut graph, "loss").expect("autodiff must succeed");
        graph.verify().expect("verify must pass");

        let w_grad = grads.get("w").expect("w must have a gradient");
        let info = &graph.tensor(w_grad).expect("tensor must exist").info;
        assert_eq!(info.shape, vec![3, 2]);
    }

    #[test]
    fn gradient_ops_are_marked_backward() {
        let mut graph = train_graph();
        grow_backward(&mut graph, "loss").expect("autodiff must succeed");
        for op_id in graph.ops_of_type("ReluGrad") {
            let op = graph.op(op_id).expect("op must exist");
            assert_eq!(op.settings.phase, Phase::Backward);
        }
        assert_eq!(graph.ops_of_type("ReluGrad").len(), 1);
        assert_eq!(graph.ops_of_type("MatMulRhsGrad").len(), 1);
    }

    #[test]
    fn fanout_gradients_are_summed() {
        // r feeds both sides of a Mul, so its gradient has two partials.
        let mut graph = Graph::new();
        graph
            .add_variable("v", f32_info(&[4]), TensorData::F32(vec![1.0; 4]))
            .expect("tensor add must succeed");
        graph
            .create_op(
                OpKind::Mul,
                &["v".to_string(), "v".to_string()],
                &["sq".to_string()],
                OpSettings::named("sq"),
            )
            .expect("op create must succeed");
        graph
            .create_op(
                OpKind::L1Loss { lambda: 1.0 },
                &["sq".to_string()],
                &["loss".to_string()],
                OpSettings::named("loss"),
            )
            .expect("op create must succeed");

        let grads = grow_backward(&mut graph, "loss").expect("autodiff must succeed");
        graph.verify().expect("verify must pass");
        assert!(grads.get("v").is_some());
        assert_eq!(graph.ops_of_type("Sum").len(), 1);
    }

    #[test]
    fn ops_without_gradients_are_a_model_error() {
        let mut graph = Graph::new();
        graph
            .add_stream_input("x", f32_info(&[2]))
            .expect("tensor add must succeed");
        let op_id = graph
            .create_op(
                OpKind::IoCopy,
                &["x".to_string()],
                &["y".to_string()],
                OpSettings::default(),
            )
            .expect("op create must succeed");
        let op = graph.op(op_id).expect("op must exist").clone();
        let err = grad_defs(&graph, &op).expect_err("grad defs must fail");
        assert!(matches!(err, CompileError::NoGradImpl { .. }));
    }

    #[test]
    fn sgd_updates_every_trainable_with_a_gradient() {
        let mut graph = train_graph();
        let grads = grow_backward(&mut graph, "loss").expect("autodiff must succeed");
        let updates = apply_sgd(&mut graph, &grads, 0.01).expect("sgd must succeed");
        assert_eq!(updates.len(), 1);
        graph.verify().expect("verify must pass");
    }
}
