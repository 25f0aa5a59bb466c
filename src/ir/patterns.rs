//! Graph rewriting to a fixed point.
//!
//! A [`Pattern`] matches one op at a time and rewrites the graph around
//! it. The driver keeps a worklist of ops to revisit: whenever a
//! pattern fires, the neighborhood of every touched tensor is queued
//! again, until no pattern matches anywhere.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::debug;

use crate::error::{internal_error, Result};
use crate::ir::graph::Graph;
use crate::ir::op::{OpId, OpKind};
use crate::ir::tensor::TensorId;

pub trait Pattern {
    fn name(&self) -> &'static str;

    /// Whether the pattern fires on this op.
    fn matches(&self, graph: &Graph, op: OpId) -> Result<bool>;

    /// The tensors the rewrite would touch. The driver refuses patterns
    /// whose touched set intersects the anchors, unless `anchor_safe`.
    fn touches(&self, graph: &Graph, op: OpId) -> Result<Vec<TensorId>>;

    /// Rewrite the graph around `op`. Only called after `matches`.
    fn apply(&self, graph: &mut Graph, op: OpId) -> Result<()>;

    /// True when the rewrite preserves every touched tensor and its
    /// observable value.
    fn anchor_safe(&self) -> bool {
        false
    }
}

/// Switches and knobs for the rewrite phase.
#[derive(Debug, Clone)]
pub struct PatternConfig {
    pub op_to_identity: bool,
    pub identity_removal: bool,
    pub scale_fusion: bool,
    pub inplace: bool,
    /// Per-op-type overrides for in-place conversion priority. Negative
    /// values disable the conversion for that type.
    pub inplace_priorities: BTreeMap<String, f64>,
    /// Hard cap on total pattern applications. Hitting it means a
    /// pattern set that does not converge, reported as an internal
    /// error rather than a hang.
    pub max_applications: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            op_to_identity: true,
            identity_removal: true,
            scale_fusion: true,
            inplace: true,
            inplace_priorities: BTreeMap::new(),
            max_applications: 10_000,
        }
    }
}

impl PatternConfig {
    #[must_use]
    pub fn no_rewrites() -> Self {
        Self {
            op_to_identity: false,
            identity_removal: false,
            scale_fusion: false,
            inplace: false,
            ..Self::default()
        }
    }

    #[must_use]
    fn is_enabled(&self, name: &str) -> bool {
        match name {
            "OpToIdentity" => self.op_to_identity,
            "IdentityRemoval" => self.identity_removal,
            "ScaleFusion" => self.scale_fusion,
            "Inplace" => self.inplace,
            _ => false,
        }
    }
}

type PatternFactory = fn(&PatternConfig) -> Box<dyn Pattern>;

/// Explicit name-to-factory table. Registration order is not load
/// bearing; the driver converges to the same graph regardless.
pub struct PatternRegistry {
    factories: Vec<(&'static str, PatternFactory)>,
}

impl PatternRegistry {
    #[must_use]
    pub fn with_builtins() -> Self {
        Self {
            factories: vec![
                ("OpToIdentity", |_| Box::new(OpToIdentityPattern)),
                ("IdentityRemoval", |_| Box::new(IdentityRemovalPattern)),
                ("ScaleFusion", |_| Box::new(ScaleFusionPattern)),
                ("Inplace", |config| {
                    Box::new(crate::ir::inplace::InplacePattern::new(
                        config.inplace_priorities.clone(),
                    ))
                }),
            ],
        }
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|(name, _)| *name).collect()
    }

    #[must_use]
    pub fn create_enabled(&self, config: &PatternConfig) -> Vec<Box<dyn Pattern>> {
        self.factories
            .iter()
            .filter(|(name, _)| config.is_enabled(name))
            .map(|(_, factory)| factory(config))
            .collect()
    }
}

/// Run the pattern set to a fixed point. Returns the number of
/// rewrites applied.
pub fn apply_patterns(
    graph: &mut Graph,
    patterns: &[Box<dyn Pattern>],
    max_applications: usize,
) -> Result<usize> {
    let mut queue: VecDeque<OpId> = graph.topo_order()?.into();
    let mut queued: BTreeSet<OpId> = queue.iter().copied().collect();
    let mut applied = 0;

    while let Some(op_id) = queue.pop_front() {
        queued.remove(&op_id);
        for pattern in patterns {
            if graph.op(op_id).is_err() {
                break;
            }
            if !pattern.matches(graph, op_id)? {
                continue;
            }
            let touched = pattern.touches(graph, op_id)?;
            if !pattern.anchor_safe() && touched.iter().any(|t| graph.is_anchored(t)) {
                continue;
            }

            pattern.apply(graph, op_id)?;
            applied += 1;
            debug!("applied {} at {op_id}", pattern.name());
            if applied > max_applications {
                return Err(internal_error(format!(
                    "pattern set did not converge within {max_applications} applications"
                )));
            }

            let mut requeue = |id: OpId, queue: &mut VecDeque<OpId>, queued: &mut BTreeSet<OpId>| {
                if queued.insert(id) {
                    queue.push_back(id);
                }
            };
            for tensor_id in &touched {
                if !graph.has_tensor(tensor_id) {
                    continue;
                }
                let tensor = graph.tensor(tensor_id)?;
                if let Some(producer) = tensor.producer {
                    requeue(producer, &mut queue, &mut queued);
                }
                for consumer in tensor.consumers.keys() {
                    requeue(*consumer, &mut queue, &mut queued);
                }
            }
            if graph.op(op_id).is_ok() {
                requeue(op_id, &mut queue, &mut queued);
            }
        }
    }
    Ok(applied)
}

/// Degenerate ops become `Identity`: single-input `Sum`/`Concat`, a
/// `Slice` covering its whole input, an all-zero `Pad`, a `ReduceSumTo`
/// onto the unchanged shape and a `Scale` by one.
pub struct OpToIdentityPattern;

impl Pattern for OpToIdentityPattern {
    fn name(&self) -> &'static str {
        "OpToIdentity"
    }

    fn matches(&self, graph: &Graph, op_id: OpId) -> Result<bool> {
        let op = graph.op(op_id)?;
        Ok(match &op.kind {
            OpKind::Sum | OpKind::Concat { .. } => op.inputs.len() == 1,
            OpKind::Slice { .. } | OpKind::ReduceSumTo { .. } => {
                let in_info = &graph.in_infos(op_id)?[0];
                let out = op
                    .output_id(0)
                    .map(|t| graph.tensor(t))
                    .transpose()?
                    .map(|t| t.info.clone());
                out.is_some_and(|info| info.shape == in_info.shape)
            }
            OpKind::Pad { lower, upper } => {
                lower.iter().all(|v| *v == 0) && upper.iter().all(|v| *v == 0)
            }
            OpKind::Scale { factor } => *factor == 1.0,
            _ => false,
        })
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
        graph.op_mut(op_id)?.kind = OpKind::Identity;
        graph.setup_op(op_id)
    }

    fn anchor_safe(&self) -> bool {
        // Every tensor survives with its value unchanged.
        true
    }
}

/// Rewires consumers past an `Identity` and drops it.
pub struct IdentityRemovalPattern;

impl Pattern for IdentityRemovalPattern {
    fn name(&self) -> &'static str {
        "IdentityRemoval"
    }

    fn matches(&self, graph: &Graph, op_id: OpId) -> Result<bool> {
        Ok(graph.op(op_id)?.kind == OpKind::Identity)
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
        let op = graph.op(op_id)?;
        let input = op
            .input_id(0)
            .cloned()
            .ok_or_else(|| internal_error(format!("{} has no input 0", op.debug_name())))?;
        let output = op
            .output_id(0)
            .cloned()
            .ok_or_else(|| internal_error(format!("{} has no output 0", op.debug_name())))?;

        let consumers: Vec<(OpId, Vec<usize>)> = graph
            .tensor(&output)?
            .consumers
            .iter()
            .map(|(id, indices)| (*id, indices.clone()))
            .collect();
        for (consumer, indices) in consumers {
            for index in indices {
                graph.disconnect_in(consumer, index)?;
                graph.connect_in(consumer, index, &input)?;
            }
        }
        graph.disconnect_all_inputs(op_id)?;
        graph.disconnect_all_outputs(op_id)?;
        graph.erase_op(op_id)?;
        graph.remove_tensor(&output)?;
        Ok(())
    }
}

/// Folds a chain of two `Scale` ops into one with the product factor.
/// Strictly decreases the op count, so it cannot ping-pong.
pub struct ScaleFusionPattern;

impl ScaleFusionPattern {
    /// The upstream scale, when `op` is a scale fed by a single-use
    /// scale.
    fn upstream(graph: &Graph, op_id: OpId) -> Result<Option<OpId>> {
        let op = graph.op(op_id)?;
        let OpKind::Scale { .. } = op.kind else {
            return Ok(None);
        };
        let Some(input) = op.input_id(0) else {
            return Ok(None);
        };
        let tensor = graph.tensor(input)?;
        let Some(producer) = tensor.producer else {
            return Ok(None);
        };
        if tensor.consumer_count() != 1 {
            return Ok(None);
        }
        match graph.op(producer)?.kind {
            OpKind::Scale { .. } => Ok(Some(producer)),
            _ => Ok(None),
        }
    }
}

impl Pattern for ScaleFusionPattern {
    fn name(&self) -> &'static str {
        "ScaleFusion"
    }

    fn matches(&self, graph: &Graph, op_id: OpId) -> Result<bool> {
        Ok(Self::upstream(graph, op_id)?.is_some())
    }

    fn touches(&self, graph: &Graph, op_id: OpId) -> Result<Vec<TensorId>> {
        let mut touched = IdentityRemovalPattern.touches(graph, op_id)?;
        if let Some(upstream) = Self::upstream(graph, op_id)? {
            touched.extend(graph.op(upstream)?.inputs.values().cloned());
        }
        Ok(touched)
    }

    fn apply(&self, graph: &mut Graph, op_id: OpId) -> Result<()> {
        let upstream = Self::upstream(graph, op_id)?
            .ok_or_else(|| internal_error("ScaleFusion applied without a match"))?;
        let up_op = graph.op(upstream)?;
        let OpKind::Scale { factor: up_factor } = up_op.kind else {
            return Err(internal_error("ScaleFusion upstream is not a Scale"));
        };
        let source = up_op
            .input_id(0)
            .cloned()
            .ok_or_else(|| internal_error("ScaleFusion upstream has no input"))?;
        let mid = up_op
            .output_id(0)
            .cloned()
            .ok_or_else(|| internal_error("ScaleFusion upstream has no output"))?;

        let OpKind::Scale { factor } = graph.op(op_id)?.kind else {
            return Err(internal_error("ScaleFusion target is not a Scale"));
        };

        graph.disconnect_in(op_id, 0)?;
        graph.connect_in(op_id, 0, &source)?;
        graph.op_mut(op_id)?.kind = OpKind::Scale {
            factor: factor * up_factor,
        };
        graph.setup_op(op_id)?;

        graph.disconnect_all_inputs(upstream)?;
        graph.disconnect_all_outputs(upstream)?;
        graph.erase_op(upstream)?;
        graph.remove_tensor(&mid)?;
        Ok(())
    }
}
