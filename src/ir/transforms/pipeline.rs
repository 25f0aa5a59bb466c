//! Pipeline staging.
//!
//! Each op's pipeline stage is taken from its virtual graph. A tensor
//! produced at one stage and consumed at a later one must survive
//! several in-flight batches, so the producer side stashes it and the
//! consumer side restores it, with the stash sized to the stage gap.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{model_error, Result};
use crate::ir::graph::Graph;
use crate::ir::op::{OpId, OpKind, OpSettings};
use crate::ir::transforms::Transform;

pub struct PipelineTransform;

impl Transform for PipelineTransform {
    fn id(&self) -> &'static str {
        "Pipeline"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        // Stage assignment first: stage = vgraph.
        let op_ids = graph.op_ids();
        if op_ids.is_empty() {
            return Ok(false);
        }
        let mut changed = false;
        for op_id in &op_ids {
            let op = graph.op_mut(*op_id)?;
            let Some(vgraph) = op.settings.vgraph else {
                return Err(model_error(format!(
                    "pipelining requires every op to have a virtual graph, {} has none",
                    op.debug_name()
                )));
            };
            if op.settings.pipeline_stage != Some(vgraph) {
                op.settings.pipeline_stage = Some(vgraph);
                changed = true;
            }
        }

        let mut stashes = 0;
        for tensor_id in graph.tensor_ids() {
            let tensor = graph.tensor(&tensor_id)?;
            let Some(producer) = tensor.producer else {
                continue;
            };
            let Some(produced_at) = graph.op(producer)?.settings.pipeline_stage else {
                continue;
            };

            // Later-stage consumers, grouped by their stage.
            let mut late: BTreeMap<u32, Vec<(OpId, usize)>> = BTreeMap::new();
            for (consumer, indices) in &tensor.consumers {
                let op = graph.op(*consumer)?;
                if matches!(op.kind, OpKind::Stash { .. } | OpKind::Restore { .. }) {
                    continue;
                }
                let Some(stage) = op.settings.pipeline_stage else {
                    continue;
                };
                if stage > produced_at {
                    for index in indices {
                        late.entry(stage).or_default().push((*consumer, *index));
                    }
                }
            }

            for (stage, consumers) in late {
                let entries = (stage - produced_at + 1) as usize;
                let producer_settings = graph.op(producer)?.settings.clone();
                let stash_out = graph.temp_tensor_id(&format!("{tensor_id}_stash"));
                graph.create_op(
                    OpKind::Stash { entries },
                    std::slice::from_ref(&tensor_id),
                    &[stash_out.clone()],
                    OpSettings {
                        name: format!("{tensor_id}_stash_s{stage}"),
                        phase: producer_settings.phase,
                        vgraph: producer_settings.vgraph,
                        pipeline_stage: Some(produced_at),
                        ..OpSettings::default()
                    },
                )?;

                let restored = graph.temp_tensor_id(&format!("{tensor_id}_restore"));
                let consumer_vgraph = graph.op(consumers[0].0)?.settings.vgraph;
                graph.create_op(
                    OpKind::Restore { entries },
                    &[stash_out],
                    &[restored.clone()],
                    OpSettings {
                        name: format!("{tensor_id}_restore_s{stage}"),
                        phase: graph.op(consumers[0].0)?.settings.phase,
                        vgraph: consumer_vgraph,
                        pipeline_stage: Some(stage),
                        ..OpSettings::default()
                    },
                )?;

                for (consumer, index) in consumers {
                    graph.disconnect_in(consumer, index)?;
                    graph.connect_in(consumer, index, &restored)?;
                }
                stashes += 1;
            }
        }

        if stashes > 0 {
            debug!("pipelining inserted {stashes} stash/restore pairs");
        }
        Ok(changed || stashes > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tensor::{DType, TensorInfo};
    use crate::ir::transforms::run_with_verifier_guard;

    fn f32_info(shape: &[usize]) -> TensorInfo {
        TensorInfo::new(DType::F32, shape.to_vec())
    }

    fn staged_graph() -> Graph {
        // relu on vgraph 0 feeds adds on vgraph 0 and vgraph 2.
        let mut graph = Graph::new();
        graph
            .add_stream_input("x", f32_info(&[4]))
            .expect("tensor add must succeed");
        graph
            .create_op(
                OpKind::Relu,
                &["x".to_string()],
                &["r".to_string()],
                OpSettings {
                    vgraph: Some(0),
                    ..OpSettings::default()
                },
            )
            .expect("op create must succeed");
        graph
            .create_op(
                OpKind::Scale { factor: 2.0 },
                &["r".to_string()],
                &["near".to_string()],
                OpSettings {
                    vgraph: Some(0),
                    ..OpSettings::default()
                },
            )
            .expect("op create must succeed");
        graph
            .create_op(
                OpKind::Scale { factor: 3.0 },
                &["r".to_string()],
                &["far".to_string()],
                OpSettings {
                    vgraph: Some(2),
                    ..OpSettings::default()
                },
            )
            .expect("op create must succeed");
        graph
    }

    #[test]
    fn stage_gaps_get_stash_restore_pairs() {
        let mut graph = staged_graph();
        run_with_verifier_guard(&mut graph, &PipelineTransform)
            .expect("transform must succeed");

        let stashes = graph.ops_of_type("Stash");
        let restores = graph.ops_of_type("Restore");
        assert_eq!(stashes.len(), 1);
        assert_eq!(restores.len(), 1);

        // Stash depth covers the whole stage gap.
        let stash = graph.op(stashes[0]).expect("op must exist");
        assert_eq!(stash.kind, OpKind::Stash { entries: 3 });
        assert_eq!(stash.settings.pipeline_stage, Some(0));
        let restore = graph.op(restores[0]).expect("op must exist");
        assert_eq!(restore.settings.pipeline_stage, Some(2));
    }

    #[test]
    fn same_stage_consumers_read_directly() {
        let mut graph = staged_graph();
        run_with_verifier_guard(&mut graph, &PipelineTransform)
            .expect("transform must succeed");

        // The vgraph-0 consumer still reads r; only the far one was
        // rewired onto a restore.
        let near = graph.ops_of_type("Scale")[0];
        assert_eq!(
            graph.op(near).expect("op must exist").input_id(0),
            Some(&"r".to_string())
        );
    }

    #[test]
    fn a_second_run_reports_no_change() {
        let mut graph = staged_graph();
        let changed = run_with_verifier_guard(&mut graph, &PipelineTransform)
            .expect("transform must succeed");
        assert!(changed);

        let changed = run_with_verifier_guard(&mut graph, &PipelineTransform)
            .expect("transform must succeed");
        assert!(!changed);
        assert_eq!(graph.ops_of_type("Stash").len(), 1);
    }

    #[test]
    fn unpartitioned_graphs_are_rejected() {
        let mut graph = Graph::new();
        graph
            .add_stream_input("x", f32_info(&[4]))
            .expect("tensor add must succeed");
        graph
            .create_op(
                OpKind::Relu,
                &["x".to_string()],
                &["r".to_string()],
                OpSettings::default(),
            )
            .expect("op create must succeed");

        let err = PipelineTransform.apply(&mut graph).expect_err("must fail");
        assert_eq!(err.category(), crate::error::ErrorCategory::Model);
    }
}
