//! Cost-balanced virtual-graph partitioning.
//!
//! Ops are assigned to `num_vgraphs` partitions by walking the
//! schedule and cutting at even fractions of the total op cost; every
//! tensor that crosses a cut gets an explicit `IoCopy` into the
//! consuming partition.

use std::collections::BTreeMap;

use log::debug;

use crate::error::Result;
use crate::ir::graph::Graph;
use crate::ir::op::{OpId, OpKind, OpSettings};
use crate::ir::tensor::{TensorId, TensorInfo};
use crate::ir::transforms::Transform;

pub struct PartitionTransform {
    num_vgraphs: u32,
}

impl PartitionTransform {
    #[must_use]
    pub fn new(num_vgraphs: u32) -> Self {
        Self { num_vgraphs }
    }
}

impl Transform for PartitionTransform {
    fn id(&self) -> &'static str {
        "Partition"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        if self.num_vgraphs <= 1 || graph.op_count() == 0 {
            return Ok(false);
        }

        let order = graph.topo_order()?;
        let mut costs = Vec::with_capacity(order.len());
        let mut total = 0.0;
        for op_id in &order {
            let ins = graph.in_infos(*op_id)?;
            let op = graph.op(*op_id)?;
            let outs: Vec<TensorInfo> = op
                .outputs
                .values()
                .map(|t| graph.tensor(t).map(|tensor| tensor.info.clone()))
                .collect::<Result<_>>()?;
            let cost = op.kind.cost(&ins, &outs);
            costs.push(cost);
            total += cost;
        }
        if total <= 0.0 {
            return Ok(false);
        }

        // Cut the schedule at even cost fractions. Greedy and
        // contiguous, so crossing tensors only ever flow forward.
        let mut cumulative = 0.0;
        for (op_id, cost) in order.iter().zip(&costs) {
            let fraction = cumulative / total;
            let vgraph = ((fraction * f64::from(self.num_vgraphs)) as u32)
                .min(self.num_vgraphs - 1);
            graph.op_mut(*op_id)?.settings.vgraph = Some(vgraph);
            cumulative += cost;
        }

        let copies = insert_boundary_copies(graph)?;
        debug!(
            "partitioned {} ops across {} vgraphs, {copies} copies inserted",
            order.len(),
            self.num_vgraphs
        );
        Ok(true)
    }
}

/// One `IoCopy` per (crossing tensor, consuming vgraph) pair; the
/// consumers in that partition are rewired onto the copy's output.
fn insert_boundary_copies(graph: &mut Graph) -> Result<usize> {
    let mut inserted = 0;
    for tensor_id in graph.tensor_ids() {
        let tensor = graph.tensor(&tensor_id)?;
        let Some(producer) = tensor.producer else {
            continue;
        };
        let producer_vgraph = graph.op(producer)?.settings.vgraph;

        // Consumers in a different partition, grouped by their vgraph.
        let mut remote: BTreeMap<u32, Vec<(OpId, usize)>> = BTreeMap::new();
        for (consumer, indices) in &tensor.consumers {
            let settings = &graph.op(*consumer)?.settings;
            if settings.vgraph == producer_vgraph {
                continue;
            }
            if let Some(vgraph) = settings.vgraph {
                for index in indices {
                    remote.entry(vgraph).or_default().push((*consumer, *index));
                }
            }
        }

        for (vgraph, consumers) in remote {
            let copy_out = graph.temp_tensor_id(&format!("{tensor_id}_vg{vgraph}"));
            let settings = OpSettings {
                name: format!("{tensor_id}_copy_vg{vgraph}"),
                vgraph: Some(vgraph),
                phase: graph.op(producer)?.settings.phase,
                ..OpSettings::default()
            };
            graph.create_op(
                OpKind::IoCopy,
                std::slice::from_ref(&tensor_id),
                &[copy_out.clone()],
                settings,
            )?;
            for (consumer, index) in consumers {
                graph.disconnect_in(consumer, index)?;
                graph.connect_in(consumer, index, &copy_out)?;
            }
            inserted += 1;
        }
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tensor::DType;
    use crate::ir::transforms::run_with_verifier_guard;

    fn f32_info(shape: &[usize]) -> TensorInfo {
        TensorInfo::new(DType::F32, shape.to_vec())
    }

    fn chain_of_matmuls(n: usize) -> Graph {
        let mut graph = Graph::new();
        graph
            .add_stream_input("x", f32_info(&[8, 8]))
            .expect("tensor add must succeed");
        let mut last = "x".to_string();
        for i in 0..n {
            graph
                .add_variable(
                    format!("w{i}"),
                    f32_info(&[8, 8]),
                    crate::ir::tensor::TensorData::F32(vec![0.1; 64]),
                )
                .expect("tensor add must succeed");
            let out = format!("h{i}");
            graph
                .create_op(
                    OpKind::MatMul,
                    &[last.clone(), format!("w{i}")],
                    &[out.clone()],
                    OpSettings::named(format!("mm{i}")),
                )
                .expect("op create must succeed");
            last = out;
        }
        graph
    }

    #[test]
    fn every_op_lands_in_a_partition() {
        let mut graph = chain_of_matmuls(4);
        run_with_verifier_guard(&mut graph, &PartitionTransform::new(2))
            .expect("transform must succeed");

        for op_id in graph.op_ids() {
            assert!(graph.op(op_id).expect("op must exist").settings.vgraph.is_some());
        }
    }

    #[test]
    fn crossing_tensors_get_copies() {
        let mut graph = chain_of_matmuls(4);
        run_with_verifier_guard(&mut graph, &PartitionTransform::new(2))
            .expect("transform must succeed");

        let copies = graph.ops_of_type("IoCopy");
        assert!(!copies.is_empty());
        // Each copy sits in the partition of the consumer it feeds.
        for copy in copies {
            let op = graph.op(copy).expect("op must exist");
            let out = op.output_id(0).expect("copy must have an output");
            for consumer in graph.tensor(out).expect("tensor must exist").consumers.keys() {
                assert_eq!(
                    graph.op(*consumer).expect("op must exist").settings.vgraph,
                    op.settings.vgraph
                );
            }
        }
    }

    #[test]
    fn single_partition_is_a_no_op() {
        let mut graph = chain_of_matmuls(3);
        let changed = run_with_verifier_guard(&mut graph, &PartitionTransform::new(1))
            .expect("transform must succeed");
        assert!(!changed);
        assert!(graph.ops_of_type("IoCopy").is_empty());
    }
}
