//! The input-model boundary.
//!
//! Hosts describe a model as plain data ([`ModelDesc`]); an
//! [`OpRegistry`] maps op-type names to kind factories. Registration is
//! an explicit table, so what the compiler accepts is visible in one
//! place.

use std::collections::BTreeMap;

use crate::error::{model_error, CompileError, Result};
use crate::ir::graph::Graph;
use crate::ir::op::{OpKind, OpSettings, RecomputeKind};
use crate::ir::tensor::{TensorData, TensorId, TensorInfo};

#[derive(Debug, Clone)]
pub enum AttrValue {
    Float(f32),
    Int(i64),
    Ints(Vec<i64>),
    Shape(Vec<usize>),
}

#[derive(Debug, Clone, Default)]
pub struct NodeDesc {
    pub op_type: String,
    pub name: String,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl NodeDesc {
    #[must_use]
    pub fn new(op_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_io(mut self, inputs: Vec<TensorId>, outputs: Vec<TensorId>) -> Self {
        self.inputs = inputs;
        self.outputs = outputs;
        self
    }

    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    fn float_attr(&self, key: &str) -> Result<f32> {
        match self.attrs.get(key) {
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(_) => Err(model_error(format!(
                "node `{}`: attribute `{key}` must be a float",
                self.name
            ))),
            None => Err(model_error(format!(
                "node `{}`: missing attribute `{key}`",
                self.name
            ))),
        }
    }

    fn int_attr(&self, key: &str) -> Result<i64> {
        match self.attrs.get(key) {
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(_) => Err(model_error(format!(
                "node `{}`: attribute `{key}` must be an int",
                self.name
            ))),
            None => Err(model_error(format!(
                "node `{}`: missing attribute `{key}`",
                self.name
            ))),
        }
    }

    fn ints_attr(&self, key: &str) -> Result<Vec<i64>> {
        match self.attrs.get(key) {
            Some(AttrValue::Ints(v)) => Ok(v.clone()),
            Some(_) => Err(model_error(format!(
                "node `{}`: attribute `{key}` must be an int list",
                self.name
            ))),
            None => Err(model_error(format!(
                "node `{}`: missing attribute `{key}`",
                self.name
            ))),
        }
    }

    fn usizes_attr(&self, key: &str) -> Result<Vec<usize>> {
        let ints = self.ints_attr(key)?;
        ints.iter()
            .map(|v| {
                usize::try_from(*v).map_err(|_| {
                    model_error(format!(
                        "node `{}`: attribute `{key}` must be non-negative",
                        self.name
                    ))
                })
            })
            .collect()
    }
}

/// A whole model as plain data. Tensors are declared up front; nodes
/// reference them (and each other's outputs) by id.
#[derive(Debug, Clone, Default)]
pub struct ModelDesc {
    pub inputs: Vec<(TensorId, TensorInfo)>,
    pub consts: Vec<(TensorId, TensorInfo, TensorData)>,
    pub variables: Vec<(TensorId, TensorInfo, TensorData)>,
    pub nodes: Vec<NodeDesc>,
}

type KindFactory = fn(&NodeDesc) -> Result<OpKind>;

/// Explicit op-type table. `with_builtins` registers the whole
/// surface operator set; hosts may register aliases on top.
pub struct OpRegistry {
    factories: BTreeMap<String, KindFactory>,
}

impl OpRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("Add", |_| Ok(OpKind::Add));
        registry.register("Mul", |_| Ok(OpKind::Mul));
        registry.register("Scale", |node| {
            Ok(OpKind::Scale {
                factor: node.float_attr("factor")?,
            })
        });
        registry.register("MatMul", |_| Ok(OpKind::MatMul));
        registry.register("Relu", |_| Ok(OpKind::Relu));
        registry.register("Exp", |_| Ok(OpKind::Exp));
        registry.register("Identity", |_| Ok(OpKind::Identity));
        registry.register("Concat", |node| {
            Ok(OpKind::Concat {
                axis: usize::try_from(node.int_attr("axis")?)
                    .map_err(|_| model_error("Concat axis must be non-negative"))?,
            })
        });
        registry.register("Slice", |node| {
            let lower = node.usizes_attr("lower")?;
            let upper = node.usizes_attr("upper")?;
            if lower.len() != upper.len() {
                return Err(model_error(format!(
                    "node `{}`: slice bounds disagree in rank",
                    node.name
                )));
            }
            Ok(OpKind::Slice {
                slices: lower.into_iter().zip(upper).collect(),
            })
        });
        registry.register("Pad", |node| {
            Ok(OpKind::Pad {
                lower: node.usizes_attr("lower")?,
                upper: node.usizes_attr("upper")?,
            })
        });
        registry.register("Sum", |_| Ok(OpKind::Sum));
        registry.register("L1Loss", |node| {
            Ok(OpKind::L1Loss {
                lambda: node.float_attr("lambda")?,
            })
        });
        registry
    }

    pub fn register(&mut self, op_type: impl Into<String>, factory: KindFactory) {
        self.factories.insert(op_type.into(), factory);
    }

    pub fn create(&self, node: &NodeDesc) -> Result<OpKind> {
        let factory = self.factories.get(&node.op_type).ok_or_else(|| {
            CompileError::Model(format!(
                "no op registered for type `{}` (node `{}`)",
                node.op_type, node.name
            ))
        })?;
        factory(node)
    }
}

/// Build a graph from a model description. Nodes are added in model
/// order; forward references are a model error.
pub fn build_graph(model: &ModelDesc, registry: &OpRegistry) -> Result<Graph> {
    let mut graph = Graph::new();
    for (id, info) in &model.inputs {
        graph.add_stream_input(id.clone(), info.clone())?;
    }
    for (id, info, data) in &model.consts {
        graph.add_const(id.clone(), info.clone(), data.clone())?;
    }
    for (id, info, data) in &model.variables {
        graph.add_variable(id.clone(), info.clone(), data.clone())?;
    }

    for node in &model.nodes {
        let kind = registry.create(node)?;
        for input in &node.inputs {
            if !graph.has_tensor(input) {
                return Err(model_error(format!(
                    "node `{}` reads undeclared tensor `{input}`",
                    node.name
                )));
            }
        }
        let recompute = match node.attrs.get("recompute") {
            Some(AttrValue::Int(1)) => RecomputeKind::Recompute,
            _ => RecomputeKind::Checkpoint,
        };
        let vgraph = match node.attrs.get("vgraph") {
            Some(AttrValue::Int(v)) => u32::try_from(*v).ok(),
            _ => None,
        };
        let settings = OpSettings {
            name: node.name.clone(),
            recompute,
            vgraph,
            ..OpSettings::default()
        };
        graph.create_op(kind, &node.inputs, &node.outputs, settings)?;
    }
    graph.verify()?;
    Ok(graph)
}
