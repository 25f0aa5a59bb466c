//! Copy batching.
//!
//! Several single-tensor `IoCopy` ops whose outputs all feed the same
//! consumer first can cross the partition boundary as one batched copy.
//! The merged op keeps the original output tensors, so nothing else in
//! the graph moves.

use std::collections::BTreeMap;

use log::debug;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::op::{OpId, OpKind, OpSettings};
use crate::ir::tensor::TensorId;
use crate::ir::transforms::Transform;

pub struct MergeCopiesTransform;

impl Transform for MergeCopiesTransform {
    fn id(&self) -> &'static str {
        "MergeCopies"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        let order = graph.topo_order()?;
        let position: BTreeMap<OpId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        // Mergeable copies keyed by (first consumer, copy vgraph).
        let mut groups: BTreeMap<(OpId, Option<u32>), Vec<OpId>> = BTreeMap::new();
        for copy in graph.ops_of_type("IoCopy") {
            let op = graph.op(copy)?;
            if op.inputs.len() != 1 || op.outputs.len() != 1 {
                continue;
            }
            let out = op
                .output_id(0)
                .ok_or_else(|| crate::error::internal_error("IoCopy without output"))?;
            let Some(first) = first_consumer(graph, out, &position)? else {
                continue;
            };
            groups
                .entry((first, op.settings.vgraph))
                .or_default()
                .push(copy);
        }

        let mut merged = 0;
        for ((consumer, vgraph), copies) in groups {
            if copies.len() < 2 {
                continue;
            }
            merge_group(graph, consumer, vgraph, &copies)?;
            merged += 1;
        }
        if merged > 0 {
            debug!("merged {merged} copy groups");
        }
        Ok(merged > 0)
    }
}

/// The schedule-first consumer of a tensor, or None for none.
fn first_consumer(
    graph: &Graph,
    tensor_id: &str,
    position: &BTreeMap<OpId, usize>,
) -> Result<Option<OpId>> {
    let tensor = graph.tensor(tensor_id)?;
    Ok(tensor
        .consumers
        .keys()
        .min_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX))
        .copied())
}

fn merge_group(
    graph: &mut Graph,
    consumer: OpId,
    vgraph: Option<u32>,
    copies: &[OpId],
) -> Result<()> {
    let mut sources: Vec<TensorId> = Vec::with_capacity(copies.len());
    let mut outputs: Vec<TensorId> = Vec::with_capacity(copies.len());
    let mut phase = None;
    for copy in copies {
        let op = graph.op(*copy)?;
        sources.push(
            op.input_id(0)
                .cloned()
                .ok_or_else(|| crate::error::internal_error("IoCopy without input"))?,
        );
        outputs.push(
            op.output_id(0)
                .cloned()
                .ok_or_else(|| crate::error::internal_error("IoCopy without output"))?,
        );
        phase.get_or_insert(op.settings.phase);
        graph.disconnect_all_inputs(*copy)?;
        graph.disconnect_all_outputs(*copy)?;
        graph.erase_op(*copy)?;
    }

    let settings = OpSettings {
        name: format!("merged_copy_for_{}", graph.op(consumer)?.debug_name()),
        vgraph,
        phase: phase.unwrap_or_default(),
        ..OpSettings::default()
    };
    graph.attach_op(OpKind::IoCopy, &sources, &outputs, settings)?;
    Ok(())
}
