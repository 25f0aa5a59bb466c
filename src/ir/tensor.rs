use std::collections::BTreeMap;

use crate::error::{model_error, CompileError};
use crate::ir::op::OpId;

/// Tensors are addressed by string id throughout the compiler. Pattern
/// rewrites mint fresh ids with a graph-scoped counter.
pub type TensorId = String;

pub type Shape = Vec<usize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    I32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorInfo {
    #[must_use]
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    #[must_use]
    pub fn f32(shape: Shape) -> Self {
        Self::new(DType::F32, shape)
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn nelms(&self) -> usize {
        self.shape.iter().product()
    }

    /// Numpy-style broadcast of two shapes, as used by the binary
    /// elementwise ops. Shapes are aligned at the trailing axis; each
    /// axis pair must be equal or contain a 1.
    pub fn np_out(&self, other: &TensorInfo) -> Result<TensorInfo, CompileError> {
        if self.dtype != other.dtype {
            return Err(model_error(format!(
                "dtype mismatch in broadcast: {:?} vs {:?}",
                self.dtype, other.dtype
            )));
        }
        let rank = self.rank().max(other.rank());
        let mut shape = vec![0; rank];
        for axis in 0..rank {
            let a = dim_from_end(&self.shape, rank - 1 - axis);
            let b = dim_from_end(&other.shape, rank - 1 - axis);
            shape[axis] = if a == b || b == 1 {
                a
            } else if a == 1 {
                b
            } else {
                return Err(model_error(format!(
                    "shapes {:?} and {:?} are not broadcastable",
                    self.shape, other.shape
                )));
            };
        }
        Ok(TensorInfo::new(self.dtype, shape))
    }
}

/// Axis length counted from the trailing axis, 1 when the shape is too
/// short (numpy alignment rule).
fn dim_from_end(shape: &[usize], from_end: usize) -> usize {
    if from_end < shape.len() {
        shape[shape.len() - 1 - from_end]
    } else {
        1
    }
}

/// Compile-time payload of a tensor, present for constants and for
/// variables with known initial values.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl TensorData {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
        }
    }
}

/// How a tensor enters the graph. `Stream` tensors are fed at run time
/// and seed the non-constant flood fill; `Variable` tensors join them
/// only when training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    Stream,
    Const,
    Variable,
    ActGrad,
}

/// A tensor node in the graph arena. Owned exclusively by the graph;
/// every cross-reference is an id resolved through it.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub id: TensorId,
    pub info: TensorInfo,
    pub kind: TensorKind,
    pub data: Option<TensorData>,
    pub producer: Option<OpId>,
    /// Consumer op to the input indices at which it consumes this
    /// tensor. BTreeMap keeps iteration deterministic.
    pub consumers: BTreeMap<OpId, Vec<usize>>,
}

impl Tensor {
    #[must_use]
    pub fn new(id: TensorId, info: TensorInfo, kind: TensorKind) -> Self {
        Self {
            id,
            info,
            kind,
            data: None,
            producer: None,
            consumers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_aligns_trailing_axes() {
        let a = TensorInfo::f32(vec![2, 3, 4]);
        let b = TensorInfo::f32(vec![4]);
        let out = a.np_out(&b).expect("broadcast must succeed");
        assert_eq!(out.shape, vec![2, 3, 4]);
    }

    #[test]
    fn broadcast_expands_unit_axes_on_either_side() {
        let a = TensorInfo::f32(vec![1, 3]);
        let b = TensorInfo::f32(vec![5, 1]);
        let out = a.np_out(&b).expect("broadcast must succeed");
        assert_eq!(out.shape, vec![5, 3]);
    }

    #[test]
    fn incompatible_shapes_are_a_model_error() {
        let a = TensorInfo::f32(vec![2, 3]);
        let b = TensorInfo::f32(vec![2, 4]);
        let err = a.np_out(&b).expect_err("broadcast must fail");
        assert_eq!(err.category(), crate::error::ErrorCategory::Model);
    }

    #[test]
    fn nelms_is_the_shape_product() {
        assert_eq!(TensorInfo::f32(vec![2, 3, 4]).nelms(), 24);
        assert_eq!(TensorInfo::f32(vec![]).nelms(), 1);
    }
}
