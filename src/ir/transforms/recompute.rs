//! Explicit recomputation.
//!
//! A forward op flagged for recompute is cloned once per execution
//! context (virtual graph, pipeline stage) that consumes its outputs on
//! the backward path; those consumers are rewired onto the clone, so
//! the original activation does not need to be live across the whole
//! backward pass. Cloning is transitive: a flagged op feeding another
//! flagged op is cloned into every context the downstream clone needs,
//! and the downstream clone reads the recomputed chain rather than the
//! forward value.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::op::{OpId, OpSettings, Phase, RecomputeKind};
use crate::ir::tensor::TensorId;
use crate::ir::transforms::Transform;

type Context = (Option<u32>, Option<u32>);

pub struct RecomputeTransform;

impl Transform for RecomputeTransform {
    fn id(&self) -> &'static str {
        "Recompute"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        let flagged: Vec<OpId> = graph
            .topo_order()?
            .into_iter()
            .filter(|id| {
                graph.op(*id).is_ok_and(|op| {
                    op.settings.recompute == RecomputeKind::Recompute
                        && op.settings.phase == Phase::Forward
                })
            })
            .collect();
        if flagged.is_empty() {
            return Ok(false);
        }
        let flagged_set: BTreeSet<OpId> = flagged.iter().copied().collect();

        // Contexts each flagged op must be recomputed in: those of its
        // direct backward consumers, plus every context a downstream
        // flagged op is cloned into, so clone chains stay connected.
        let mut needed: BTreeMap<OpId, BTreeSet<Context>> = BTreeMap::new();
        for op_id in &flagged {
            needed.insert(*op_id, backward_contexts(graph, *op_id)?);
        }
        for op_id in flagged.iter().rev() {
            let mut inherited: BTreeSet<Context> = BTreeSet::new();
            for tensor_id in graph.op(*op_id)?.outputs.values() {
                for consumer in graph.tensor(tensor_id)?.consumers.keys() {
                    if flagged_set.contains(consumer) {
                        if let Some(contexts) = needed.get(consumer) {
                            inherited.extend(contexts.iter().copied());
                        }
                    }
                }
            }
            if let Some(contexts) = needed.get_mut(op_id) {
                contexts.extend(inherited);
            }
        }

        // Per context, a map from forward tensor to its recomputed
        // twin. Topological order guarantees a producer's clone exists
        // before any consumer clone needs it.
        let mut clones: BTreeMap<Context, BTreeMap<TensorId, TensorId>> = BTreeMap::new();
        let mut cloned = 0;
        for op_id in &flagged {
            for context in needed[op_id].clone() {
                clone_into_context(graph, *op_id, context, clones.entry(context).or_default())?;
                cloned += 1;
            }
            // The request is resolved either way; what remains is a
            // plain checkpointed forward op.
            graph.op_mut(*op_id)?.settings.recompute = RecomputeKind::Checkpoint;
        }
        if cloned > 0 {
            debug!("recompute cloned {cloned} ops");
        }
        Ok(cloned > 0)
    }
}

/// The execution contexts of `op_id`'s direct backward consumers.
fn backward_contexts(graph: &Graph, op_id: OpId) -> Result<BTreeSet<Context>> {
    let mut contexts = BTreeSet::new();
    for tensor_id in graph.op(op_id)?.outputs.values() {
        for consumer in graph.tensor(tensor_id)?.consumers.keys() {
            let settings = &graph.op(*consumer)?.settings;
            if settings.phase == Phase::Backward {
                contexts.insert((settings.vgraph, settings.pipeline_stage));
            }
        }
    }
    Ok(contexts)
}

/// Clone `op_id` into `context`, reading already-recomputed inputs
/// where the chain provides them, and rewire the context's backward
/// consumers onto the clone's outputs.
fn clone_into_context(
    graph: &mut Graph,
    op_id: OpId,
    context: Context,
    clone_map: &mut BTreeMap<TensorId, TensorId>,
) -> Result<()> {
    let op = graph.op(op_id)?.clone();
    let (vgraph, stage) = context;

    let inputs: Vec<TensorId> = op
        .inputs
        .values()
        .map(|t| clone_map.get(t).cloned().unwrap_or_else(|| t.clone()))
        .collect();
    let outputs: Vec<TensorId> = op
        .outputs
        .keys()
        .map(|out_index| graph.temp_tensor_id(&format!("{}_rc{out_index}", op.settings.name)))
        .collect();
    let clone_id = graph.create_op(
        op.kind.clone(),
        &inputs,
        &outputs,
        OpSettings {
            name: format!("{}_recompute", op.settings.name),
            phase: Phase::Backward,
            vgraph,
            pipeline_stage: stage,
            recompute: RecomputeKind::Recomputed,
        },
    )?;

    let out_index_order: Vec<usize> = op.outputs.keys().copied().collect();
    for (out_index, clone_out) in out_index_order.iter().zip(&outputs) {
        let original = &op.outputs[out_index];
        clone_map.insert(original.clone(), clone_out.clone());

        let consumers: Vec<(OpId, Vec<usize>)> = graph
            .tensor(original)?
            .consumers
            .iter()
            .map(|(id, indices)| (*id, indices.clone()))
            .collect();
        for (consumer, indices) in consumers {
            let (phase, consumer_context) = {
                let settings = &graph.op(consumer)?.settings;
                (settings.phase, (settings.vgraph, settings.pipeline_stage))
            };
            if phase != Phase::Backward || consumer_context != context {
                continue;
            }
            for index in indices {
                graph.disconnect_in(consumer, index)?;
                graph.connect_in(consumer, index, clone_out)?;
            }
        }
    }
    debug!(
        "recomputed {} as {} for context ({vgraph:?}, {stage:?})",
        op.debug_name(),
        graph.op(clone_id)?.debug_name()
    );
    Ok(())
}
