use std::collections::BTreeMap;

use crate::error::{model_error, CompileError};
use crate::ir::tensor::{Shape, TensorId, TensorInfo};
use crate::region::{Chain, Chains, Link, RegMap, Region};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub usize);

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Which part of the program an op belongs to. Set once when the op is
/// created and read by the folder, the transforms and the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Forward,
    Backward,
    Loss,
}

/// Recompute status of an op. `Recompute` marks a request on a forward
/// op; the recompute transform turns requests into `Recomputed` clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecomputeKind {
    #[default]
    Checkpoint,
    Recompute,
    Recomputed,
}

/// Execution-context attributes shared by every op kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpSettings {
    pub name: String,
    pub phase: Phase,
    pub vgraph: Option<u32>,
    pub pipeline_stage: Option<u32>,
    pub recompute: RecomputeKind,
}

impl OpSettings {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Per-axis `(lower, upper)` bounds of a slice.
pub type Slices = Vec<(usize, usize)>;

/// The closed operator set. Third parties extend the compiler through
/// the builder's op registry, not by adding kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Add,
    Mul,
    Scale { factor: f32 },
    MatMul,
    Relu,
    Exp,
    Identity,
    Concat { axis: usize },
    Slice { slices: Slices },
    Pad { lower: Vec<usize>, upper: Vec<usize> },
    Sum,
    L1Loss { lambda: f32 },

    ReluGrad,
    L1Grad { lambda: f32 },
    MatMulLhsGrad,
    MatMulRhsGrad,
    ReduceSumTo { shape: Shape },

    SgdVarUpdate { lr: f32 },

    ReluInplace,
    ScaleInplace { factor: f32 },
    SliceInplace { slices: Slices },
    ConcatInplace { axis: usize },

    Stash { entries: usize },
    Restore { entries: usize },
    IoCopy,
}

impl OpKind {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            OpKind::Add => "Add",
            OpKind::Mul => "Mul",
            OpKind::Scale { .. } => "Scale",
            OpKind::MatMul => "MatMul",
            OpKind::Relu => "Relu",
            OpKind::Exp => "Exp",
            OpKind::Identity => "Identity",
            OpKind::Concat { .. } => "Concat",
            OpKind::Slice { .. } => "Slice",
            OpKind::Pad { .. } => "Pad",
            OpKind::Sum => "Sum",
            OpKind::L1Loss { .. } => "L1Loss",
            OpKind::ReluGrad => "ReluGrad",
            OpKind::L1Grad { .. } => "L1Grad",
            OpKind::MatMulLhsGrad => "MatMulLhsGrad",
            OpKind::MatMulRhsGrad => "MatMulRhsGrad",
            OpKind::ReduceSumTo { .. } => "ReduceSumTo",
            OpKind::SgdVarUpdate { .. } => "SgdVarUpdate",
            OpKind::ReluInplace => "ReluInplace",
            OpKind::ScaleInplace { .. } => "ScaleInplace",
            OpKind::SliceInplace { .. } => "SliceInplace",
            OpKind::ConcatInplace { .. } => "ConcatInplace",
            OpKind::Stash { .. } => "Stash",
            OpKind::Restore { .. } => "Restore",
            OpKind::IoCopy => "IoCopy",
        }
    }

    /// Output infos from input infos, in index order. Pure and
    /// idempotent; the graph calls this whenever an op is (re)wired.
    pub fn out_infos(&self, ins: &[TensorInfo]) -> Result<Vec<TensorInfo>, CompileError> {
        let require = |n: usize| -> Result<(), CompileError> {
            if ins.len() == n {
                Ok(())
            } else {
                Err(model_error(format!(
                    "{} expects {} inputs, got {}",
                    self.type_name(),
                    n,
                    ins.len()
                )))
            }
        };
        match self {
            OpKind::Add | OpKind::Mul => {
                require(2)?;
                Ok(vec![ins[0].np_out(&ins[1])?])
            }
            OpKind::Scale { .. }
            | OpKind::Relu
            | OpKind::Exp
            | OpKind::Identity
            | OpKind::ReluInplace
            | OpKind::ScaleInplace { .. } => {
                require(1)?;
                Ok(vec![ins[0].clone()])
            }
            // One output per input; merged copies carry several tensors
            // across a boundary at once.
            OpKind::IoCopy => {
                if ins.is_empty() {
                    return Err(model_error("IoCopy expects at least one input"));
                }
                Ok(ins.to_vec())
            }
            OpKind::MatMul => {
                require(2)?;
                matmul_out(&ins[0], &ins[1], false, false)
            }
            OpKind::MatMulLhsGrad => {
                // grad_out [m,n] x rhs [k,n] -> [m,k]
                require(2)?;
                matmul_out(&ins[0], &ins[1], false, true)
            }
            OpKind::MatMulRhsGrad => {
                // lhs [m,k] x grad_out [m,n] -> [k,n]
                require(2)?;
                matmul_out(&ins[0], &ins[1], true, false)
            }
            OpKind::Concat { axis } | OpKind::ConcatInplace { axis } => {
                if ins.is_empty() {
                    return Err(model_error("Concat expects at least one input"));
                }
                let mut shape = ins[0].shape.clone();
                if *axis >= shape.len() {
                    return Err(model_error(format!(
                        "Concat axis {} out of range for rank {}",
                        axis,
                        shape.len()
                    )));
                }
                for info in &ins[1..] {
                    if info.rank() != ins[0].rank() || info.dtype != ins[0].dtype {
                        return Err(model_error("Concat inputs must agree in rank and dtype"));
                    }
                    for (d, (a, b)) in ins[0].shape.iter().zip(&info.shape).enumerate() {
                        if d != *axis && a != b {
                            return Err(model_error(format!(
                                "Concat inputs disagree on non-concat axis {d}"
                            )));
                        }
                    }
                    shape[*axis] += info.shape[*axis];
                }
                Ok(vec![TensorInfo::new(ins[0].dtype, shape)])
            }
            OpKind::Slice { slices } | OpKind::SliceInplace { slices } => {
                require(1)?;
                slice_out(&ins[0], slices).map(|info| vec![info])
            }
            OpKind::Pad { lower, upper } => {
                require(1)?;
                if lower.len() != ins[0].rank() || upper.len() != ins[0].rank() {
                    return Err(model_error("Pad bounds must match input rank"));
                }
                let shape: Shape = ins[0]
                    .shape
                    .iter()
                    .zip(lower)
                    .zip(upper)
                    .map(|((d, lo), up)| d + lo + up)
                    .collect();
                Ok(vec![TensorInfo::new(ins[0].dtype, shape)])
            }
            OpKind::Sum => {
                if ins.is_empty() {
                    return Err(model_error("Sum expects at least one input"));
                }
                let mut out = ins[0].clone();
                for info in &ins[1..] {
                    out = out.np_out(info)?;
                }
                Ok(vec![out])
            }
            OpKind::L1Loss { .. } => {
                require(1)?;
                Ok(vec![TensorInfo::new(ins[0].dtype, vec![])])
            }
            OpKind::L1Grad { .. } => {
                require(1)?;
                Ok(vec![ins[0].clone()])
            }
            OpKind::ReluGrad => {
                require(2)?;
                Ok(vec![ins[0].clone()])
            }
            OpKind::ReduceSumTo { shape } => {
                require(1)?;
                Ok(vec![TensorInfo::new(ins[0].dtype, shape.clone())])
            }
            OpKind::SgdVarUpdate { .. } => {
                // in 0: variable, in 1: gradient. Output is the updated
                // variable value.
                require(2)?;
                Ok(vec![ins[0].clone()])
            }
            OpKind::Stash { entries } => {
                require(1)?;
                let mut shape = vec![*entries];
                shape.extend(&ins[0].shape);
                Ok(vec![TensorInfo::new(ins[0].dtype, shape)])
            }
            OpKind::Restore { .. } => {
                // in 0: the stash, in 1: the restore index phase anchor.
                if ins.is_empty() {
                    return Err(model_error("Restore expects the stash as input 0"));
                }
                if ins[0].rank() == 0 {
                    return Err(model_error("Restore input must be a stash tensor"));
                }
                Ok(vec![TensorInfo::new(
                    ins[0].dtype,
                    ins[0].shape[1..].to_vec(),
                )])
            }
        }
    }

    /// Whether the folder has a host kernel for this kind.
    #[must_use]
    pub fn has_const_impl(&self) -> bool {
        !matches!(
            self,
            OpKind::Stash { .. } | OpKind::Restore { .. } | OpKind::IoCopy
        ) && !self.never_foldable()
    }

    /// Kinds that may never be constant-folded regardless of their
    /// inputs: training machinery must survive to run time.
    #[must_use]
    pub fn never_foldable(&self) -> bool {
        matches!(
            self,
            OpKind::L1Loss { .. }
                | OpKind::L1Grad { .. }
                | OpKind::ReluGrad
                | OpKind::MatMulLhsGrad
                | OpKind::MatMulRhsGrad
                | OpKind::SgdVarUpdate { .. }
                | OpKind::Stash { .. }
                | OpKind::Restore { .. }
        )
    }

    /// The in-place variants this kind can be rewritten to, each with a
    /// default priority. Higher priorities are attempted first.
    #[must_use]
    pub fn inplace_variants(&self) -> Vec<(OpKind, f64)> {
        match self {
            OpKind::Relu => vec![(OpKind::ReluInplace, 10.0)],
            OpKind::Scale { factor } => {
                vec![(OpKind::ScaleInplace { factor: *factor }, 10.0)]
            }
            OpKind::Slice { slices } => vec![(
                OpKind::SliceInplace {
                    slices: slices.clone(),
                },
                20.0,
            )],
            OpKind::Concat { axis } => vec![(OpKind::ConcatInplace { axis: *axis }, 20.0)],
            _ => Vec::new(),
        }
    }

    /// View kinds alias their inputs into the output without computing
    /// anything.
    #[must_use]
    pub fn is_view(&self) -> bool {
        matches!(
            self,
            OpKind::SliceInplace { .. } | OpKind::ConcatInplace { .. }
        )
    }

    /// Input index this kind writes through, for kinds that modify an
    /// input buffer in place.
    #[must_use]
    pub fn inplace_write_index(&self) -> Option<usize> {
        match self {
            OpKind::ReluInplace | OpKind::ScaleInplace { .. } => Some(0),
            _ => None,
        }
    }

    /// Region of input `index` that the op reads, in the input's index
    /// space.
    #[must_use]
    pub fn uses(&self, index: usize, in_info: &TensorInfo) -> Region {
        match self {
            OpKind::Slice { slices } | OpKind::SliceInplace { slices } => {
                let _ = index;
                slice_region(slices)
            }
            _ => Region::full(&in_info.shape),
        }
    }

    /// Region of input `index` that the op overwrites, in the input's
    /// index space. Empty for everything except in-place writers.
    #[must_use]
    pub fn modifies(&self, index: usize, in_info: &TensorInfo) -> Region {
        match self.inplace_write_index() {
            Some(w) if w == index => Region::full(&in_info.shape),
            _ => Region::empty(in_info.rank()),
        }
    }

    /// Chains from the index space of input `index` into the output's
    /// index space. Empty for non-aliasing kinds.
    #[must_use]
    pub fn fwd_chains(
        &self,
        index: usize,
        in_infos: &[TensorInfo],
        out_info: &TensorInfo,
    ) -> Chains {
        match self {
            OpKind::ReluInplace | OpKind::ScaleInplace { .. } => {
                Chains::identity(&in_infos[index].shape)
            }
            OpKind::SliceInplace { slices } => {
                let offset: Vec<i64> = slices.iter().map(|(lo, _)| -(*lo as i64)).collect();
                Chains::single(Chain::new(Link::new(
                    slice_region(slices),
                    RegMap::Translate {
                        offset,
                        target: out_info.shape.clone(),
                    },
                )))
            }
            OpKind::ConcatInplace { axis } => {
                let mut offset = vec![0_i64; out_info.rank()];
                offset[*axis] = concat_offset(index, *axis, in_infos) as i64;
                Chains::single(Chain::new(Link::new(
                    Region::full(&in_infos[index].shape),
                    RegMap::Translate {
                        offset,
                        target: out_info.shape.clone(),
                    },
                )))
            }
            _ => Chains::empty(),
        }
    }

    /// Chains from the output's index space back into input `index`.
    #[must_use]
    pub fn bwd_chains(
        &self,
        index: usize,
        in_infos: &[TensorInfo],
        out_info: &TensorInfo,
    ) -> Chains {
        match self {
            OpKind::ReluInplace | OpKind::ScaleInplace { .. } => {
                Chains::identity(&out_info.shape)
            }
            OpKind::SliceInplace { slices } => {
                let offset: Vec<i64> = slices.iter().map(|(lo, _)| *lo as i64).collect();
                Chains::single(Chain::new(Link::new(
                    Region::full(&out_info.shape),
                    RegMap::Translate {
                        offset,
                        target: in_infos[index].shape.clone(),
                    },
                )))
            }
            OpKind::ConcatInplace { axis } => {
                let off = concat_offset(index, *axis, in_infos);
                let len = in_infos[index].shape[*axis];
                let mut lower = vec![0; out_info.rank()];
                let mut upper = out_info.shape.clone();
                lower[*axis] = off;
                upper[*axis] = off + len;
                let mut offset = vec![0_i64; out_info.rank()];
                offset[*axis] = -(off as i64);
                Chains::single(Chain::new(Link::new(
                    Region::new(lower, upper),
                    RegMap::Translate {
                        offset,
                        target: in_infos[index].shape.clone(),
                    },
                )))
            }
            _ => Chains::empty(),
        }
    }

    /// Rough flop estimate used by the cost partitioner.
    #[must_use]
    pub fn cost(&self, ins: &[TensorInfo], outs: &[TensorInfo]) -> f64 {
        match self {
            OpKind::MatMul | OpKind::MatMulLhsGrad | OpKind::MatMulRhsGrad => {
                let m = outs.first().map_or(1, |o| o.shape.first().copied().unwrap_or(1));
                let n = outs.first().map_or(1, |o| o.shape.last().copied().unwrap_or(1));
                let k = ins
                    .first()
                    .map_or(1, |i| i.shape.last().copied().unwrap_or(1));
                (2 * m * n * k) as f64
            }
            OpKind::Identity | OpKind::IoCopy => 0.0,
            _ => outs.iter().map(TensorInfo::nelms).sum::<usize>() as f64,
        }
    }
}

fn matmul_out(
    a: &TensorInfo,
    b: &TensorInfo,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<Vec<TensorInfo>, CompileError> {
    if a.rank() != 2 || b.rank() != 2 {
        return Err(model_error(format!(
            "MatMul operands must be rank 2, got {:?} and {:?}",
            a.shape, b.shape
        )));
    }
    let (m, ka) = if transpose_a {
        (a.shape[1], a.shape[0])
    } else {
        (a.shape[0], a.shape[1])
    };
    let (kb, n) = if transpose_b {
        (b.shape[1], b.shape[0])
    } else {
        (b.shape[0], b.shape[1])
    };
    if ka != kb {
        return Err(model_error(format!(
            "MatMul contraction mismatch: {:?} x {:?}",
            a.shape, b.shape
        )));
    }
    Ok(vec![TensorInfo::new(a.dtype, vec![m, n])])
}

fn slice_out(input: &TensorInfo, slices: &Slices) -> Result<TensorInfo, CompileError> {
    if slices.len() != input.rank() {
        return Err(model_error(format!(
            "Slice bounds rank {} does not match input rank {}",
            slices.len(),
            input.rank()
        )));
    }
    let mut shape = Vec::with_capacity(slices.len());
    for ((lo, up), dim) in slices.iter().zip(&input.shape) {
        if lo > up || up > dim {
            return Err(model_error(format!(
                "Slice bounds ({lo}, {up}) invalid for axis of length {dim}"
            )));
        }
        shape.push(up - lo);
    }
    Ok(TensorInfo::new(input.dtype, shape))
}

fn slice_region(slices: &Slices) -> Region {
    Region::new(
        slices.iter().map(|(lo, _)| *lo).collect(),
        slices.iter().map(|(_, up)| *up).collect(),
    )
}

/// Start offset of input `index` along the concat axis.
fn concat_offset(index: usize, axis: usize, in_infos: &[TensorInfo]) -> usize {
    in_infos[..index].iter().map(|info| info.shape[axis]).sum()
}

/// An op node in the graph arena. Inputs and outputs are sparse maps
/// from connection index to tensor id.
#[derive(Debug, Clone)]
pub struct Op {
    pub id: OpId,
    pub kind: OpKind,
    pub inputs: BTreeMap<usize, TensorId>,
    pub outputs: BTreeMap<usize, TensorId>,
    pub settings: OpSettings,
}

impl Op {
    #[must_use]
    pub fn new(id: OpId, kind: OpKind, settings: OpSettings) -> Self {
        Self {
            id,
            kind,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            settings,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    #[must_use]
    pub fn input_id(&self, index: usize) -> Option<&TensorId> {
        self.inputs.get(&index)
    }

    #[must_use]
    pub fn output_id(&self, index: usize) -> Option<&TensorId> {
        self.outputs.get(&index)
    }

    /// Input ids in connection-index order.
    #[must_use]
    pub fn input_ids(&self) -> Vec<&TensorId> {
        self.inputs.values().collect()
    }

    #[must_use]
    pub fn output_ids(&self) -> Vec<&TensorId> {
        self.outputs.values().collect()
    }

    #[must_use]
    pub fn debug_name(&self) -> String {
        if self.settings.name.is_empty() {
            format!("{}[{}]", self.type_name(), self.id)
        } else {
            format!("{}[{}]", self.type_name(), self.settings.name)
        }
    }
}
