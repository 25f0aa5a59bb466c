//! The compile driver.
//!
//! A [`CompileRequest`] fixes everything a compile depends on: anchors,
//! training setup, pattern and transform selection, schedule priorities.
//! [`compile`] then runs the phases in one fixed order, so two compiles
//! of the same model and request produce the same program.

use log::info;

use crate::error::{model_error, Result};
use crate::ir::autograd::{apply_sgd, grow_backward};
use crate::ir::builder::{build_graph, ModelDesc, OpRegistry};
use crate::ir::constexpr::{default_non_const_sources, fold_constants, ConstExprClassifier};
use crate::ir::graph::{AnchorReturnType, Graph};
use crate::ir::lowering::{lower, CompiledProgram, SchedulePriorities};
use crate::ir::patterns::{apply_patterns, PatternConfig, PatternRegistry};
use crate::ir::tensor::TensorId;
use crate::ir::transforms::{run_transforms, TransformConfig};

#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Tensor the backward pass grows from. Must be a scalar.
    pub loss: TensorId,
    pub lr: f32,
}

#[derive(Debug, Clone, Default)]
pub struct CompileRequest {
    pub anchors: Vec<(TensorId, AnchorReturnType)>,
    pub train: Option<TrainConfig>,
    pub patterns: PatternConfig,
    pub transforms: TransformConfig,
    pub priorities: SchedulePriorities,
}

/// The result of a compile: the final graph (after every rewrite and
/// transform) and the program lowered from it.
#[derive(Debug)]
pub struct CompiledSession {
    pub graph: Graph,
    pub program: CompiledProgram,
}

pub fn compile(model: &ModelDesc, registry: &OpRegistry, request: &CompileRequest) -> Result<CompiledSession> {
    info!("phase: build");
    let graph = build_graph(model, registry)?;
    compile_graph(graph, request)
}

/// Compile a graph the host assembled directly, skipping the model
/// boundary. The phase order past build is identical to [`compile`].
pub fn compile_graph(mut graph: Graph, request: &CompileRequest) -> Result<CompiledSession> {
    for (id, art) in &request.anchors {
        graph.set_anchor(id, *art)?;
    }

    let training = request.train.is_some();

    info!("phase: constant folding");
    let sources = default_non_const_sources(&graph, training);
    let classifier = ConstExprClassifier::classify(&graph, &sources)?;
    let folded = fold_constants(&mut graph, &classifier)?;
    info!("folded {folded} ops");

    if let Some(train) = &request.train {
        info!("phase: backward growth (loss `{}`)", train.loss);
        let loss = graph.tensor(&train.loss)?;
        if loss.info.nelms() != 1 {
            return Err(model_error(format!(
                "loss tensor `{}` must be a scalar, has shape {:?}",
                train.loss, loss.info.shape
            )));
        }
        let gradients = grow_backward(&mut graph, &train.loss)?;
        apply_sgd(&mut graph, &gradients, train.lr)?;
    }

    info!("phase: patterns");
    let patterns = PatternRegistry::with_builtins().create_enabled(&request.patterns);
    let applied = apply_patterns(&mut graph, &patterns, request.patterns.max_applications)?;
    info!("applied {applied} rewrites");

    info!("phase: transforms");
    run_transforms(&mut graph, &request.transforms.build())?;

    info!("phase: lowering");
    graph.verify()?;
    let program = lower(&graph, &request.priorities)?;
    Ok(CompiledSession { graph, program })
}
