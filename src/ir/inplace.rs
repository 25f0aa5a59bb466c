//! Out-of-place to in-place conversion.
//!
//! Converting an op is only sound when no other reader or writer can
//! observe the difference. The proof runs over the region algebra: the
//! written region is propagated through every aliasing edge to all
//! tensors sharing the buffer, and the conversion is rejected on any
//! overlap with another op's read or write, or with an anchored or
//! trainable tensor.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{internal_error, Result};
use crate::ir::graph::Graph;
use crate::ir::op::{OpId, OpKind};
use crate::ir::patterns::Pattern;
use crate::ir::tensor::{TensorId, TensorKind};
use crate::region::{Chains, Region};

/// An aliasing edge between an op input and output, with chains in both
/// directions.
#[derive(Debug, Clone)]
struct AliasEdge {
    input: TensorId,
    output: TensorId,
    fwd: Chains,
    bwd: Chains,
}

fn op_alias_edges(graph: &Graph, op_id: OpId) -> Result<Vec<AliasEdge>> {
    let op = graph.op(op_id)?;
    let in_infos = graph.in_infos(op_id)?;
    let Some(out_id) = op.output_id(0) else {
        return Ok(Vec::new());
    };
    let out_info = graph.tensor(out_id)?.info.clone();

    let mut edges = Vec::new();
    for (index, input) in &op.inputs {
        let fwd = op.kind.fwd_chains(*index, &in_infos, &out_info);
        if fwd.is_empty() {
            continue;
        }
        edges.push(AliasEdge {
            input: input.clone(),
            output: out_id.clone(),
            fwd,
            bwd: op.kind.bwd_chains(*index, &in_infos, &out_info),
        });
    }
    Ok(edges)
}

fn all_alias_edges(graph: &Graph) -> Result<Vec<AliasEdge>> {
    let mut edges = Vec::new();
    for op_id in graph.op_ids() {
        edges.extend(op_alias_edges(graph, op_id)?);
    }
    Ok(edges)
}

/// All regions aliasing `start` across the edge set, keyed by tensor.
/// The start pair itself is included.
fn alias_closure(
    start: (TensorId, Region),
    edges: &[AliasEdge],
) -> BTreeMap<TensorId, Vec<Region>> {
    let mut reached: BTreeMap<TensorId, Vec<Region>> = BTreeMap::new();
    let mut queue = vec![start];
    while let Some((tensor, region)) = queue.pop() {
        let known = reached.entry(tensor.clone()).or_default();
        if known.contains(&region) {
            continue;
        }
        known.push(region.clone());

        for edge in edges {
            if edge.input == tensor {
                for mapped in edge.fwd.apply(&region) {
                    queue.push((edge.output.clone(), mapped));
                }
            }
            if edge.output == tensor {
                for mapped in edge.bwd.apply(&region) {
                    queue.push((edge.input.clone(), mapped));
                }
            }
        }
    }
    reached
}

/// Converts ops to their in-place variants, highest priority first,
/// skipping any conversion whose soundness cannot be proven.
pub struct InplacePattern {
    /// Per-variant-type priority overrides; negative disables.
    priorities: BTreeMap<String, f64>,
}

impl InplacePattern {
    #[must_use]
    pub fn new(priorities: BTreeMap<String, f64>) -> Self {
        Self { priorities }
    }

    /// Candidate variants by descending priority, overrides applied.
    fn candidates(&self, kind: &OpKind) -> Vec<OpKind> {
        let mut variants: Vec<(OpKind, f64)> = kind
            .inplace_variants()
            .into_iter()
            .map(|(variant, default_pri)| {
                let pri = self
                    .priorities
                    .get(variant.type_name())
                    .copied()
                    .unwrap_or(default_pri);
                (variant, pri)
            })
            .filter(|(_, pri)| *pri >= 0.0)
            .collect();
        variants.sort_by(|a, b| b.1.total_cmp(&a.1));
        variants.into_iter().map(|(variant, _)| variant).collect()
    }

    fn first_legal(&self, graph: &Graph, op_id: OpId) -> Result<Option<OpKind>> {
        for variant in self.candidates(&graph.op(op_id)?.kind) {
            if is_legal(graph, op_id, &variant)? {
                return Ok(Some(variant));
            }
        }
        Ok(None)
    }
}

fn is_legal(graph: &Graph, op_id: OpId, variant: &OpKind) -> Result<bool> {
    if let Some(write_index) = variant.inplace_write_index() {
        legal_write(graph, op_id, variant, write_index)
    } else if variant.is_view() {
        legal_view(graph, op_id, variant)
    } else {
        Ok(false)
    }
}

/// A write conversion is sound when the written buffer regions, traced
/// through every alias, are read or written by nothing else.
fn legal_write(graph: &Graph, op_id: OpId, variant: &OpKind, write_index: usize) -> Result<bool> {
    let op = graph.op(op_id)?;
    let in_infos = graph.in_infos(op_id)?;
    let written = op
        .input_id(write_index)
        .cloned()
        .ok_or_else(|| internal_error(format!("{} has no input {write_index}", op.debug_name())))?;
    let region = variant.modifies(write_index, &in_infos[write_index]);

    let edges = all_alias_edges(graph)?;
    let closure = alias_closure((written, region), &edges);

    for (tensor_id, regions) in &closure {
        let tensor = graph.tensor(tensor_id)?;
        if graph.is_anchored(tensor_id) || tensor.kind == TensorKind::Variable {
            return Ok(false);
        }
        for (consumer, indices) in &tensor.consumers {
            if *consumer == op_id {
                continue;
            }
            let consumer_op = graph.op(*consumer)?;
            // View ops do not read; whatever reads through them is
            // already in the closure.
            if consumer_op.kind.is_view() {
                continue;
            }
            let consumer_ins = graph.in_infos(*consumer)?;
            for index in indices {
                let reads = consumer_op.kind.uses(*index, &consumer_ins[*index]);
                let writes = consumer_op.kind.modifies(*index, &consumer_ins[*index]);
                for region in regions {
                    if !reads.intersect(region).is_empty() || !writes.intersect(region).is_empty() {
                        return Ok(false);
                    }
                }
            }
        }
    }
    Ok(true)
}

/// A view conversion is sound when the alias group it would create
/// contains no in-place writer and no anchored tensor. Writers that
/// convert later re-prove their writes against the extended group.
fn legal_view(graph: &Graph, op_id: OpId, variant: &OpKind) -> Result<bool> {
    let op = graph.op(op_id)?;
    let in_infos = graph.in_infos(op_id)?;
    let Some(out_id) = op.output_id(0) else {
        return Ok(false);
    };
    let out_info = graph.tensor(out_id)?.info.clone();

    let mut edges = all_alias_edges(graph)?;
    for (index, input) in &op.inputs {
        let fwd = variant.fwd_chains(*index, &in_infos, &out_info);
        if fwd.is_empty() {
            continue;
        }
        edges.push(AliasEdge {
            input: input.clone(),
            output: out_id.clone(),
            fwd,
            bwd: variant.bwd_chains(*index, &in_infos, &out_info),
        });
    }

    let closure = alias_closure((out_id.clone(), Region::full(&out_info.shape)), &edges);
    for tensor_id in closure.keys() {
        if graph.is_anchored(tensor_id) {
            return Ok(false);
        }
        let tensor = graph.tensor(tensor_id)?;
        for (consumer, indices) in &tensor.consumers {
            let consumer_op = graph.op(*consumer)?;
            if let Some(write_index) = consumer_op.kind.inplace_write_index() {
                if indices.contains(&write_index) {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

impl Pattern for InplacePattern {
    fn name(&self) -> &'static str {
        "Inplace"
    }

    fn matches(&self, graph: &Graph, op_id: OpId) -> Result<bool> {
        Ok(self.first_legal(graph, op_id)?.is_some())
    }

    fn touches(&self, graph: &Graph, op_id: OpId) -> Result<Vec<TensorId>> {
        let op = graph.op(op_id)?;
        Ok(op
            .inputs
            .values()
            .chain(op.outputs.values())
            .cloned()
            .collect())
    }

    fn apply(&self, graph: &mut Graph, op_id: OpId) -> Result<()> {
        let variant = self
            .first_legal(graph, op_id)?
            .ok_or_else(|| internal_error("Inplace applied without a legal variant"))?;
        debug!(
            "{} -> {}",
            graph.op(op_id)?.debug_name(),
            variant.type_name()
        );
        graph.op_mut(op_id)?.kind = variant;
        graph.setup_op(op_id)
    }
}
