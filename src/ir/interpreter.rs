//! Host evaluation of the operator set.
//!
//! The interpreter exists for compile-time constant folding and for
//! checking rewrites in tests. It is not a runtime: in-place kinds are
//! evaluated by value, which is observationally equivalent because the
//! in-place pattern only fires when it can prove as much.

use std::collections::BTreeMap;

use crate::error::{internal_error, model_error, Result};
use crate::ir::graph::Graph;
use crate::ir::op::{OpKind, Slices};
use crate::ir::tensor::{DType, Shape, TensorData, TensorId, TensorInfo};

/// Evaluate one op. `ins` are input payloads with infos in connection
/// index order; `outs` are the declared output infos.
pub fn eval_op(
    kind: &OpKind,
    ins: &[(&TensorData, &TensorInfo)],
    outs: &[TensorInfo],
) -> Result<Vec<TensorData>> {
    match kind {
        OpKind::Add => binary_broadcast(ins, &outs[0], |a, b| a + b, |a, b| a + b),
        OpKind::Mul => binary_broadcast(ins, &outs[0], |a, b| a * b, |a, b| a * b),
        OpKind::Scale { factor } | OpKind::ScaleInplace { factor } => {
            let data = f32_input(ins, 0)?;
            Ok(vec![TensorData::F32(
                data.iter().map(|v| v * factor).collect(),
            )])
        }
        OpKind::Relu | OpKind::ReluInplace => {
            let data = f32_input(ins, 0)?;
            Ok(vec![TensorData::F32(
                data.iter().map(|v| v.max(0.0)).collect(),
            )])
        }
        OpKind::Exp => {
            let data = f32_input(ins, 0)?;
            Ok(vec![TensorData::F32(data.iter().map(|v| v.exp()).collect())])
        }
        OpKind::Identity => Ok(vec![ins[0].0.clone()]),
        OpKind::IoCopy => Ok(ins.iter().map(|(data, _)| (*data).clone()).collect()),
        OpKind::MatMul => matmul(ins, false, false),
        OpKind::MatMulLhsGrad => matmul(ins, false, true),
        OpKind::MatMulRhsGrad => matmul(ins, true, false),
        OpKind::Concat { axis } | OpKind::ConcatInplace { axis } => concat(ins, &outs[0], *axis),
        OpKind::Slice { slices } | OpKind::SliceInplace { slices } => {
            slice(ins[0], &outs[0], slices)
        }
        OpKind::Pad { lower, .. } => pad(ins[0], &outs[0], lower),
        OpKind::Sum => {
            let mut acc = ins[0].0.clone();
            let mut acc_info = ins[0].1.clone();
            for (data, info) in &ins[1..] {
                let out_info = acc_info.np_out(info)?;
                let summed = binary_broadcast(
                    &[(&acc, &acc_info), (data, info)],
                    &out_info,
                    |a, b| a + b,
                    |a, b| a + b,
                )?;
                acc = summed.into_iter().next().unwrap_or(acc);
                acc_info = out_info;
            }
            Ok(vec![acc])
        }
        OpKind::ReduceSumTo { shape } => reduce_sum_to(ins[0], shape),
        OpKind::L1Loss { lambda } => {
            let data = f32_input(ins, 0)?;
            Ok(vec![TensorData::F32(vec![
                data.iter().map(|v| v.abs()).sum::<f32>() * lambda,
            ])])
        }
        OpKind::L1Grad { lambda } => {
            let data = f32_input(ins, 0)?;
            Ok(vec![TensorData::F32(
                data.iter().map(|v| lambda * v.signum()).collect(),
            )])
        }
        OpKind::ReluGrad => {
            // in 0: incoming gradient, in 1: forward output.
            let grad = f32_input(ins, 0)?;
            let fwd_out = f32_input(ins, 1)?;
            Ok(vec![TensorData::F32(
                grad.iter()
                    .zip(fwd_out)
                    .map(|(g, y)| if *y > 0.0 { *g } else { 0.0 })
                    .collect(),
            )])
        }
        OpKind::SgdVarUpdate { lr } => {
            let var = f32_input(ins, 0)?;
            let grad = f32_input(ins, 1)?;
            Ok(vec![TensorData::F32(
                var.iter().zip(grad).map(|(v, g)| v - lr * g).collect(),
            )])
        }
        OpKind::Stash { .. } | OpKind::Restore { .. } => Err(internal_error(format!(
            "{} cannot be evaluated on the host",
            kind.type_name()
        ))),
    }
}

/// Evaluate the whole graph given stream feeds. Returns the value of
/// every tensor. Used by the folder's tests and the rewrite-invariance
/// checks.
pub fn evaluate(
    graph: &Graph,
    feeds: &BTreeMap<TensorId, TensorData>,
) -> Result<BTreeMap<TensorId, TensorData>> {
    let mut values: BTreeMap<TensorId, TensorData> = BTreeMap::new();
    for id in graph.tensor_ids() {
        let tensor = graph.tensor(&id)?;
        if let Some(data) = &tensor.data {
            values.insert(id.clone(), data.clone());
        } else if let Some(fed) = feeds.get(&id) {
            values.insert(id.clone(), fed.clone());
        }
    }

    for op_id in graph.topo_order()? {
        let op = graph.op(op_id)?;
        let in_infos = graph.in_infos(op_id)?;
        let mut ins: Vec<(&TensorData, &TensorInfo)> = Vec::with_capacity(in_infos.len());
        for (index, tensor_id) in &op.inputs {
            let data = values.get(tensor_id).ok_or_else(|| {
                model_error(format!(
                    "no value for `{tensor_id}` consumed by {}",
                    op.debug_name()
                ))
            })?;
            ins.push((data, &in_infos[*index]));
        }
        let out_infos: Vec<TensorInfo> = op
            .outputs
            .values()
            .map(|t| graph.tensor(t).map(|tensor| tensor.info.clone()))
            .collect::<Result<_>>()?;
        let results = eval_op(&op.kind, &ins, &out_infos)?;
        for (tensor_id, data) in op.outputs.values().zip(results) {
            values.insert(tensor_id.clone(), data);
        }
    }
    Ok(values)
}

fn f32_input<'a>(ins: &[(&'a TensorData, &TensorInfo)], index: usize) -> Result<&'a [f32]> {
    match ins.get(index) {
        Some((TensorData::F32(v), _)) => Ok(v),
        Some((TensorData::I32(_), _)) => Err(model_error("op requires F32 input")),
        None => Err(internal_error(format!("missing input {index}"))),
    }
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut out = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        out[axis] = out[axis + 1] * shape[axis + 1];
    }
    out
}

/// Linear index into `src_shape` for a multi-index of the broadcast
/// output, numpy trailing-axis alignment.
fn broadcast_index(src_shape: &[usize], out_index: &[usize]) -> usize {
    let src_strides = strides(src_shape);
    let skip = out_index.len() - src_shape.len();
    let mut linear = 0;
    for (axis, dim) in src_shape.iter().enumerate() {
        let coord = if *dim == 1 { 0 } else { out_index[skip + axis] };
        linear += coord * src_strides[axis];
    }
    linear
}

fn unravel(mut linear: usize, shape: &[usize]) -> Vec<usize> {
    let mut index = vec![0; shape.len()];
    for axis in (0..shape.len()).rev() {
        index[axis] = linear % shape[axis];
        linear /= shape[axis];
    }
    index
}

fn binary_broadcast(
    ins: &[(&TensorData, &TensorInfo)],
    out: &TensorInfo,
    f_f32: fn(f32, f32) -> f32,
    f_i32: fn(i32, i32) -> i32,
) -> Result<Vec<TensorData>> {
    let (a, a_info) = ins[0];
    let (b, b_info) = ins[1];
    let nelms = out.nelms();
    match (a, b) {
        (TensorData::F32(av), TensorData::F32(bv)) => {
            let mut data = Vec::with_capacity(nelms);
            for linear in 0..nelms {
                let index = unravel(linear, &out.shape);
                data.push(f_f32(
                    av[broadcast_index(&a_info.shape, &index)],
                    bv[broadcast_index(&b_info.shape, &index)],
                ));
            }
            Ok(vec![TensorData::F32(data)])
        }
        (TensorData::I32(av), TensorData::I32(bv)) => {
            let mut data = Vec::with_capacity(nelms);
            for linear in 0..nelms {
                let index = unravel(linear, &out.shape);
                data.push(f_i32(
                    av[broadcast_index(&a_info.shape, &index)],
                    bv[broadcast_index(&b_info.shape, &index)],
                ));
            }
            Ok(vec![TensorData::I32(data)])
        }
        _ => Err(model_error("mixed dtypes in binary op")),
    }
}

fn matmul(
    ins: &[(&TensorData, &TensorInfo)],
    transpose_a: bool,
    transpose_b: bool,
) -> Result<Vec<TensorData>> {
    let a = f32_input(ins, 0)?;
    let b = f32_input(ins, 1)?;
    let a_shape = &ins[0].1.shape;
    let b_shape = &ins[1].1.shape;
    let (m, k) = if transpose_a {
        (a_shape[1], a_shape[0])
    } else {
        (a_shape[0], a_shape[1])
    };
    let n = if transpose_b { b_shape[0] } else { b_shape[1] };

    let a_at = |row: usize, inner: usize| {
        if transpose_a {
            a[inner * a_shape[1] + row]
        } else {
            a[row * a_shape[1] + inner]
        }
    };
    let b_at = |inner: usize, col: usize| {
        if transpose_b {
            b[col * b_shape[1] + inner]
        } else {
            b[inner * b_shape[1] + col]
        }
    };

    let mut data = vec![0.0; m * n];
    for row in 0..m {
        for col in 0..n {
            let mut acc = 0.0;
            for inner in 0..k {
                acc += a_at(row, inner) * b_at(inner, col);
            }
            data[row * n + col] = acc;
        }
    }
    Ok(vec![TensorData::F32(data)])
}

fn concat(
    ins: &[(&TensorData, &TensorInfo)],
    out: &TensorInfo,
    axis: usize,
) -> Result<Vec<TensorData>> {
    let mut data = match ins[0].0 {
        TensorData::F32(_) => TensorData::F32(Vec::with_capacity(out.nelms())),
        TensorData::I32(_) => TensorData::I32(Vec::with_capacity(out.nelms())),
    };
    // Outer block count is the product of axes before the concat axis;
    // inputs interleave one axis-block at a time.
    let outer: usize = out.shape[..axis].iter().product();
    for block in 0..outer {
        for (src, info) in ins {
            let block_len = info.shape[axis..].iter().product::<usize>();
            let start = block * block_len;
            match (&mut data, src) {
                (TensorData::F32(dst), TensorData::F32(v)) => {
                    dst.extend_from_slice(&v[start..start + block_len]);
                }
                (TensorData::I32(dst), TensorData::I32(v)) => {
                    dst.extend_from_slice(&v[start..start + block_len]);
                }
                _ => return Err(model_error("mixed dtypes in Concat")),
            }
        }
    }
    Ok(vec![data])
}

fn slice(
    input: (&TensorData, &TensorInfo),
    out: &TensorInfo,
    slices: &Slices,
) -> Result<Vec<TensorData>> {
    let (src, info) = input;
    let src_strides = strides(&info.shape);
    let gather = |linear: usize| -> usize {
        let index = unravel(linear, &out.shape);
        index
            .iter()
            .zip(slices)
            .zip(&src_strides)
            .map(|((coord, (lo, _)), stride)| (coord + lo) * stride)
            .sum()
    };
    match src {
        TensorData::F32(v) => Ok(vec![TensorData::F32(
            (0..out.nelms()).map(|i| v[gather(i)]).collect(),
        )]),
        TensorData::I32(v) => Ok(vec![TensorData::I32(
            (0..out.nelms()).map(|i| v[gather(i)]).collect(),
        )]),
    }
}

fn pad(
    input: (&TensorData, &TensorInfo),
    out: &TensorInfo,
    lower: &[usize],
) -> Result<Vec<TensorData>> {
    let (src, info) = input;
    let src_strides = strides(&info.shape);
    let v = match src {
        TensorData::F32(v) => v,
        TensorData::I32(_) => return Err(model_error("Pad requires F32 input")),
    };
    let mut data = vec![0.0_f32; out.nelms()];
    for (dst, slot) in data.iter_mut().enumerate() {
        let index = unravel(dst, &out.shape);
        let mut linear = 0;
        let mut inside = true;
        for ((coord, lo), (dim, stride)) in index
            .iter()
            .zip(lower)
            .zip(info.shape.iter().zip(&src_strides))
        {
            if coord < lo || coord - lo >= *dim {
                inside = false;
                break;
            }
            linear += (coord - lo) * stride;
        }
        if inside {
            *slot = v[linear];
        }
    }
    Ok(vec![TensorData::F32(data)])
}

fn reduce_sum_to(input: (&TensorData, &TensorInfo), target: &Shape) -> Result<Vec<TensorData>> {
    let (src, info) = input;
    let v = match src {
        TensorData::F32(v) => v,
        TensorData::I32(_) => return Err(model_error("ReduceSumTo requires F32 input")),
    };
    let out_nelms: usize = target.iter().product();
    let mut data = vec![0.0_f32; out_nelms];
    let target_strides = strides(target);
    for (linear, value) in v.iter().enumerate() {
        let index = unravel(linear, &info.shape);
        // Align at the trailing axis, collapse axes the target lacks or
        // keeps at length 1.
        let skip = info.shape.len() - target.len();
        let mut out_linear = 0;
        for (axis, dim) in target.iter().enumerate() {
            let coord = if *dim == 1 { 0 } else { index[skip + axis] };
            out_linear += coord * target_strides[axis];
        }
        data[out_linear] += value;
    }
    Ok(vec![TensorData::F32(data)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_info(shape: &[usize]) -> TensorInfo {
        TensorInfo::new(DType::F32, shape.to_vec())
    }

    #[test]
    fn add_broadcasts_a_row_vector() {
        let a = TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = TensorData::F32(vec![10.0, 20.0, 30.0]);
        let out = eval_op(
            &OpKind::Add,
            &[(&a, &f32_info(&[2, 3])), (&b, &f32_info(&[3]))],
            &[f32_info(&[2, 3])],
        )
        .expect("eval must succeed");
        assert_eq!(
            out[0],
            TensorData::F32(vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0])
        );
    }

    #[test]
    fn matmul_matches_a_hand_computation() {
        let a = TensorData::F32(vec![1.0, 2.0, 3.0, 4.0]);
        let b = TensorData::F32(vec![5.0, 6.0, 7.0, 8.0]);
        let out = eval_op(
            &OpKind::MatMul,
            &[(&a, &f32_info(&[2, 2])), (&b, &f32_info(&[2, 2]))],
            &[f32_info(&[2, 2])],
        )
        .expect("eval must succeed");
        assert_eq!(out[0], TensorData::F32(vec![19.0, 22.0, 43.0, 50.0]));
    }

    #[test]
    fn slice_then_pad_restores_shape_with_zero_fill() {
        let x = TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let sliced = eval_op(
            &OpKind::Slice {
                slices: vec![(1, 4)],
            },
            &[(&x, &f32_info(&[5]))],
            &[f32_info(&[3])],
        )
        .expect("eval must succeed");
        assert_eq!(sliced[0], TensorData::F32(vec![2.0, 3.0, 4.0]));

        let padded = eval_op(
            &OpKind::Pad {
                lower: vec![1],
                upper: vec![1],
            },
            &[(&sliced[0], &f32_info(&[3]))],
            &[f32_info(&[5])],
        )
        .expect("eval must succeed");
        assert_eq!(padded[0], TensorData::F32(vec![0.0, 2.0, 3.0, 4.0, 0.0]));
    }

    #[test]
    fn concat_on_the_inner_axis_interleaves_blocks() {
        let a = TensorData::F32(vec![1.0, 2.0, 3.0, 4.0]);
        let b = TensorData::F32(vec![9.0, 8.0]);
        let out = eval_op(
            &OpKind::Concat { axis: 1 },
            &[(&a, &f32_info(&[2, 2])), (&b, &f32_info(&[2, 1]))],
            &[f32_info(&[2, 3])],
        )
        .expect("eval must succeed");
        assert_eq!(
            out[0],
            TensorData::F32(vec![1.0, 2.0, 9.0, 3.0, 4.0, 8.0])
        );
    }

    #[test]
    fn reduce_sum_to_collapses_the_broadcast_axes() {
        let x = TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = reduce_sum_to((&x, &f32_info(&[2, 3])), &vec![3])
            .expect("reduce must succeed");
        assert_eq!(out[0], TensorData::F32(vec![5.0, 7.0, 9.0]));
    }

    #[test]
    fn relu_grad_masks_by_the_forward_output() {
        let grad = TensorData::F32(vec![1.0, 1.0, 1.0]);
        let fwd = TensorData::F32(vec![0.5, 0.0, 2.0]);
        let out = eval_op(
            &OpKind::ReluGrad,
            &[(&grad, &f32_info(&[3])), (&fwd, &f32_info(&[3]))],
            &[f32_info(&[3])],
        )
        .expect("eval must succeed");
        assert_eq!(out[0], TensorData::F32(vec![1.0, 0.0, 1.0]));
    }
}
