//! Lowering: from the optimized graph to a linear program of work
//! items a backend can consume.
//!
//! Every tensor initialization, stream setup and op growth becomes a
//! [`PriTask`]; data dependencies become prerequisites; and the
//! priority knobs steer the linearization (initialize early, grow ops
//! as their inputs land). The result is a [`CompiledProgram`]: the
//! work order plus one [`OpContract`] per op describing what the
//! backend must materialize and what the op writes.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{CompileError, Result};
use crate::ir::graph::{AnchorReturnType, Graph};
use crate::ir::op::OpId;
use crate::ir::scheduler::{PriTask, PriTasks, TaskId};
use crate::ir::tensor::{Tensor, TensorId, TensorInfo, TensorKind};

/// One unit of lowered work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoweredWork {
    /// Allocate (and fill, for consts and variables) a graph-input
    /// tensor.
    InitTensor { tensor: TensorId },
    /// Wire up the host-to-device stream for a stream tensor.
    StreamSetup { tensor: TensorId },
    /// Emit the computation of one op.
    GrowOp { op: OpId },
}

/// Scheduling priorities for the lowering tasks. The defaults front-
/// load initialization and stream plumbing; all are adjustable.
#[derive(Debug, Clone, Copy)]
pub struct SchedulePriorities {
    pub init_tensor: f64,
    pub stream_setup: f64,
    pub grow_op: f64,
}

impl Default for SchedulePriorities {
    fn default() -> Self {
        Self {
            init_tensor: 1e9,
            stream_setup: 1e8,
            grow_op: 0.0,
        }
    }
}

/// What the backend owes one op: inputs that must be materialized
/// before it runs, the input it overwrites if it runs in place, and
/// the outputs it declares.
#[derive(Debug, Clone)]
pub struct OpContract {
    pub op: OpId,
    pub type_name: &'static str,
    pub must_materialize: Vec<TensorId>,
    pub writes_inplace: Option<usize>,
    pub outputs: Vec<(TensorId, TensorInfo)>,
}

#[derive(Debug, Clone)]
pub struct CompiledProgram {
    /// Work items in execution order.
    pub schedule: Vec<LoweredWork>,
    /// Contracts for every op, in schedule order.
    pub contracts: Vec<OpContract>,
    pub anchors: BTreeMap<TensorId, AnchorReturnType>,
}

fn init_task_id(tensor: &str) -> TaskId {
    TaskId::new(format!("init/{tensor}"))
}

fn stream_task_id(tensor: &str) -> TaskId {
    TaskId::new(format!("stream/{tensor}"))
}

fn grow_task_id(op: OpId) -> TaskId {
    TaskId::new(format!("grow/{op}"))
}

/// Build and linearize the lowering task set.
pub fn lower(graph: &Graph, priorities: &SchedulePriorities) -> Result<CompiledProgram> {
    graph.verify()?;
    let mut tasks: PriTasks<LoweredWork> = PriTasks::new();

    for tensor_id in graph.tensor_ids() {
        let tensor = graph.tensor(&tensor_id)?;
        if tensor.producer.is_some() {
            continue;
        }
        tasks.add(PriTask::new(
            init_task_id(&tensor_id),
            priorities.init_tensor,
            Vec::new(),
            LoweredWork::InitTensor {
                tensor: tensor_id.clone(),
            },
        ));
        if tensor.kind == TensorKind::Stream {
            tasks.add(PriTask::new(
                stream_task_id(&tensor_id),
                priorities.stream_setup,
                vec![init_task_id(&tensor_id)],
                LoweredWork::StreamSetup {
                    tensor: tensor_id.clone(),
                },
            ));
        }
    }

    for op_id in graph.op_ids() {
        let op = graph.op(op_id)?;
        let mut deps = Vec::with_capacity(op.inputs.len());
        for tensor_id in op.inputs.values() {
            let tensor = graph.tensor(tensor_id)?;
            let dep = match tensor.producer {
                Some(producer) => grow_task_id(producer),
                None if tensor.kind == TensorKind::Stream => stream_task_id(tensor_id),
                None => init_task_id(tensor_id),
            };
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        tasks.add(PriTask::new(
            grow_task_id(op_id),
            priorities.grow_op,
            deps,
            LoweredWork::GrowOp { op: op_id },
        ));
    }

    let order = tasks.linearised()?;
    let schedule: Vec<LoweredWork> = order.iter().map(|task| task.payload.clone()).collect();

    let mut contracts = Vec::new();
    for work in &schedule {
        let LoweredWork::GrowOp { op } = work else {
            continue;
        };
        let op = graph.op(*op)?;
        let outputs = op
            .outputs
            .values()
            .map(|t| graph.tensor(t).map(|tensor| (t.clone(), tensor.info.clone())))
            .collect::<Result<_>>()?;
        contracts.push(OpContract {
            op: op.id,
            type_name: op.type_name(),
            must_materialize: op.inputs.values().cloned().collect(),
            writes_inplace: op.kind.inplace_write_index(),
            outputs,
        });
    }

    debug!(
        "lowered {} work items ({} op contracts)",
        schedule.len(),
        contracts.len()
    );
    Ok(CompiledProgram {
        schedule,
        contracts,
        anchors: graph.anchors().clone(),
    })
}

/// An opaque fault raised by a backend. The compiler passes the
/// message through unchanged; it never interprets it.
#[derive(Debug, Clone)]
pub struct BackendFault {
    pub message: String,
}

/// The output seam. A backend consumes the lowered program item by
/// item; its faults surface as backend-category errors.
pub trait LoweringBackend {
    fn init_tensor(&mut self, tensor: &Tensor) -> std::result::Result<(), BackendFault>;
    fn setup_stream(&mut self, tensor: &Tensor) -> std::result::Result<(), BackendFault>;
    fn grow_op(&mut self, contract: &OpContract) -> std::result::Result<(), BackendFault>;
}

/// Drive a backend through the program.
pub fn emit_to_backend(
    graph: &Graph,
    program: &CompiledProgram,
    backend: &mut dyn LoweringBackend,
) -> Result<()> {
    let mut contracts = program.contracts.iter();
    for work in &program.schedule {
        let fault = match work {
            LoweredWork::InitTensor { tensor } => backend.init_tensor(graph.tensor(tensor)?),
            LoweredWork::StreamSetup { tensor } => backend.setup_stream(graph.tensor(tensor)?),
            LoweredWork::GrowOp { op } => {
                let contract = contracts.next().ok_or_else(|| {
                    crate::error::internal_error("contract list shorter than schedule")
                })?;
                if contract.op != *op {
                    return Err(crate::error::internal_error(
                        "contract order diverged from schedule",
                    ));
                }
                backend.grow_op(contract)
            }
        };
        fault.map_err(|f| CompileError::Backend(f.message))?;
    }
    Ok(())
}
