//! Whole-graph transform passes, run in a fixed declared order after
//! the pattern fixed point.

pub mod merge_copies;
pub mod partition;
pub mod pipeline;
pub mod recompute;

use log::debug;

use crate::error::Result;
use crate::ir::graph::Graph;

pub use merge_copies::MergeCopiesTransform;
pub use partition::PartitionTransform;
pub use pipeline::PipelineTransform;
pub use recompute::RecomputeTransform;

pub trait Transform {
    fn id(&self) -> &'static str;

    /// Apply the transform. Returns whether the graph changed.
    fn apply(&self, graph: &mut Graph) -> Result<bool>;
}

/// Switches for the transform phase. The order the transforms run in
/// is fixed; these only control which ones run at all.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub partition: bool,
    pub pipeline: bool,
    pub recompute: bool,
    pub merge_copies: bool,
    /// Number of cost-balanced partitions the partitioner targets.
    pub num_vgraphs: u32,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            partition: false,
            pipeline: false,
            recompute: true,
            merge_copies: true,
            num_vgraphs: 1,
        }
    }
}

impl TransformConfig {
    /// The enabled transforms, in their fixed run order: partition,
    /// pipeline, recompute, merge-copies.
    #[must_use]
    pub fn build(&self) -> Vec<Box<dyn Transform>> {
        let mut transforms: Vec<Box<dyn Transform>> = Vec::new();
        if self.partition {
            transforms.push(Box::new(PartitionTransform::new(self.num_vgraphs)));
        }
        if self.pipeline {
            transforms.push(Box::new(PipelineTransform));
        }
        if self.recompute {
            transforms.push(Box::new(RecomputeTransform));
        }
        if self.merge_copies {
            transforms.push(Box::new(MergeCopiesTransform));
        }
        transforms
    }
}

/// Run one transform, then re-verify the graph. A verifier failure
/// after a transform is a bug in the transform, surfaced immediately
/// rather than downstream.
pub fn run_with_verifier_guard(graph: &mut Graph, transform: &dyn Transform) -> Result<bool> {
    debug!("running transform {}", transform.id());
    let changed = transform.apply(graph)?;
    if changed {
        graph.verify()?;
    }
    Ok(changed)
}

/// Run all transforms in order.
pub fn run_transforms(graph: &mut Graph, transforms: &[Box<dyn Transform>]) -> Result<()> {
    for transform in transforms {
        run_with_verifier_guard(graph, transform.as_ref())?;
    }
    Ok(())
}
