//! Constant-expression classification and folding.
//!
//! Classification is a flood fill: every tensor starts constant, the
//! named sources (stream inputs, and variables when training) are
//! marked non-constant, and non-constness propagates forward through
//! any op with a non-constant input. Folding then evaluates every
//! all-constant op on the host and replaces its outputs with constant
//! tensors.

use std::collections::BTreeSet;

use log::debug;

use crate::error::{CompileError, Result};
use crate::ir::graph::Graph;
use crate::ir::interpreter::eval_op;
use crate::ir::op::Phase;
use crate::ir::tensor::{TensorData, TensorId, TensorInfo, TensorKind};

#[derive(Debug, Clone)]
pub struct ConstExprClassifier {
    known: BTreeSet<TensorId>,
    non_const: BTreeSet<TensorId>,
}

impl ConstExprClassifier {
    /// Flood-fill classification from the given non-constant sources.
    pub fn classify(graph: &Graph, non_const_sources: &[TensorId]) -> Result<Self> {
        let known: BTreeSet<TensorId> = graph.tensor_ids().into_iter().collect();
        let mut non_const = BTreeSet::new();
        for source in non_const_sources {
            // Sources must exist; a bad id here is a wiring bug in the
            // caller, not a property of the model.
            graph.tensor(source)?;
            non_const.insert(source.clone());
        }

        for op_id in graph.topo_order()? {
            let op = graph.op(op_id)?;
            if op.inputs.values().any(|t| non_const.contains(t)) {
                for out in op.outputs.values() {
                    non_const.insert(out.clone());
                }
            }
        }
        Ok(Self { known, non_const })
    }

    /// Panics on an id the classified graph never contained. Callers
    /// only hold ids taken from the same graph.
    #[must_use]
    pub fn is_const(&self, id: &str) -> bool {
        assert!(self.known.contains(id), "no tensor `{id}` was classified");
        !self.non_const.contains(id)
    }
}

/// The standard source set: stream inputs always, variables when
/// training (their values change between runs).
#[must_use]
pub fn default_non_const_sources(graph: &Graph, training: bool) -> Vec<TensorId> {
    graph
        .tensor_ids()
        .into_iter()
        .filter(|id| {
            graph.tensor(id).is_ok_and(|t| {
                t.kind == TensorKind::Stream || (training && t.kind == TensorKind::Variable)
            })
        })
        .collect()
}

/// Fold every all-constant op, in topological order so folded outputs
/// feed later folds in the same sweep. Returns the number of ops
/// folded.
pub fn fold_constants(graph: &mut Graph, classifier: &ConstExprClassifier) -> Result<usize> {
    let mut folded = 0;
    for op_id in graph.topo_order()? {
        let op = graph.op(op_id)?;
        let all_const = !op.inputs.is_empty()
            && op
                .inputs
                .values()
                .all(|t| classifier.is_const(t));
        if !all_const {
            continue;
        }

        if op.kind.never_foldable() || op.settings.phase != Phase::Forward {
            return Err(CompileError::NeverFoldable {
                op_type: op.type_name().to_string(),
                name: op.debug_name(),
            });
        }
        if !op.kind.has_const_impl() {
            return Err(CompileError::NoConstExprImpl {
                op_type: op.type_name().to_string(),
                name: op.debug_name(),
            });
        }

        // Inputs are const by classification but their payloads arrive
        // as earlier ops in the sweep fold. Not yet materialized means
        // not yet foldable, not an error.
        let mut ins: Vec<(TensorData, TensorInfo)> = Vec::with_capacity(op.inputs.len());
        let mut ready = true;
        for tensor_id in op.inputs.values() {
            let tensor = graph.tensor(tensor_id)?;
            match &tensor.data {
                Some(data) => ins.push((data.clone(), tensor.info.clone())),
                None => {
                    ready = false;
                    break;
                }
            }
        }
        if !ready {
            continue;
        }

        let out_infos: Vec<TensorInfo> = op
            .outputs
            .values()
            .map(|t| graph.tensor(t).map(|tensor| tensor.info.clone()))
            .collect::<Result<_>>()?;
        let in_refs: Vec<(&TensorData, &TensorInfo)> =
            ins.iter().map(|(d, i)| (d, i)).collect();
        let results = eval_op(&op.kind, &in_refs, &out_infos)?;
        debug!("folding {}", op.debug_name());

        let outputs: Vec<TensorId> = op.outputs.values().cloned().collect();
        let inputs: Vec<TensorId> = op.inputs.values().cloned().collect();
        graph.disconnect_all_inputs(op_id)?;
        graph.disconnect_all_outputs(op_id)?;
        graph.erase_op(op_id)?;

        for (tensor_id, data) in outputs.iter().zip(results) {
            let tensor = graph.tensor_mut(tensor_id)?;
            tensor.kind = TensorKind::Const;
            tensor.data = Some(data);
        }
        for tensor_id in inputs {
            prune_if_orphaned(graph, &tensor_id)?;
        }
        folded += 1;
    }
    if folded > 0 {
        debug!("constant folding removed {folded} ops");
    }
    Ok(folded)
}

fn prune_if_orphaned(graph: &mut Graph, id: &str) -> Result<()> {
    let tensor = graph.tensor(id)?;
    if tensor.producer.is_none() && tensor.consumers.is_empty() && !graph.is_anchored(id) {
        graph.remove_tensor(id)?;
    }
    Ok(())
}
