//! The gradient definition table must stay wired to reality: for every
//! grad-bearing kind, each declared input tag must resolve against the
//! forward op's actual inputs and outputs, each gradient op's input
//! slots must be fully assigned, and every forward input must receive
//! a gradient from some definition.

use std::collections::BTreeSet;

use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

use faraday::ir::autograd::{grad_defs, GradOpInType};
use faraday::ir::graph::Graph;
use faraday::ir::op::{OpId, OpKind, OpSettings};
use faraday::ir::tensor::{DType, TensorInfo};

fn f32_info(shape: &[usize]) -> TensorInfo {
    TensorInfo::new(DType::F32, shape.to_vec())
}

fn forward_op(shapes: &[Vec<usize>], kind: OpKind) -> (Graph, OpId) {
    let mut graph = Graph::new();
    let inputs: Vec<String> = shapes
        .iter()
        .enumerate()
        .map(|(i, shape)| {
            let id = format!("in{i}");
            graph
                .add_stream_input(id.clone(), f32_info(shape))
                .expect("input must add");
            id
        })
        .collect();
    let op_id = graph
        .create_op(kind, &inputs, &["out".to_string()], OpSettings::default())
        .expect("op must create");
    (graph, op_id)
}

fn check_wiring(graph: &Graph, op_id: OpId) {
    let op = graph.op(op_id).expect("op must exist");
    let defs = grad_defs(graph, op).expect("gradients must exist");
    assert!(!defs.is_empty(), "{} produced no gradient defs", op.type_name());

    let mut receiving: BTreeSet<usize> = BTreeSet::new();
    for def in &defs {
        let slots: BTreeSet<usize> = def.inputs.iter().map(|m| m.grad_in).collect();
        assert_eq!(
            slots,
            (0..def.inputs.len()).collect::<BTreeSet<_>>(),
            "{} grad `{}` leaves an input slot unassigned",
            op.type_name(),
            def.kind.type_name()
        );
        for mapper in &def.inputs {
            let resolves = match mapper.ty {
                GradOpInType::In => op.input_id(mapper.fwd_index).is_some(),
                GradOpInType::Out | GradOpInType::GradOut => {
                    op.output_id(mapper.fwd_index).is_some()
                }
            };
            assert!(
                resolves,
                "{} grad `{}` names forward index {} ({:?}) which does not exist",
                op.type_name(),
                def.kind.type_name(),
                mapper.fwd_index,
                mapper.ty
            );
        }
        for nongrad_in in def.out_to_nongrad_in.values() {
            assert!(
                op.input_id(*nongrad_in).is_some(),
                "{} grad `{}` produces a gradient for missing input {}",
                op.type_name(),
                def.kind.type_name(),
                nongrad_in
            );
            receiving.insert(*nongrad_in);
        }
    }

    let all_inputs: BTreeSet<usize> = op.inputs.keys().copied().collect();
    assert_eq!(
        receiving,
        all_inputs,
        "{} leaves some inputs without a gradient",
        op.type_name()
    );
}

proptest! {
    #![proptest_config(ProptestConfig {
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn every_grad_bearing_kind_resolves_against_its_forward_op(
        n in 1usize..6,
        m in 1usize..4,
        k in 1usize..4,
        cols in 1usize..4,
        arity in 2usize..5,
        factor in -3.0f32..3.0,
        lambda in 0.01f32..1.0,
    ) {
        for kind in [
            OpKind::Relu,
            OpKind::Exp,
            OpKind::Identity,
            OpKind::Scale { factor },
            OpKind::L1Loss { lambda },
        ] {
            let (graph, op) = forward_op(&[vec![n]], kind);
            check_wiring(&graph, op);
        }

        for kind in [OpKind::Add, OpKind::Mul] {
            let (graph, op) = forward_op(&[vec![n], vec![n]], kind);
            check_wiring(&graph, op);
        }

        let (graph, op) = forward_op(&vec![vec![n]; arity], OpKind::Sum);
        check_wiring(&graph, op);

        let (graph, op) = forward_op(&[vec![m, k], vec![k, cols]], OpKind::MatMul);
        check_wiring(&graph, op);

        let (graph, op) = forward_op(&[vec![n + 2]], OpKind::Slice { slices: vec![(1, n + 1)] });
        check_wiring(&graph, op);

        let (graph, op) = forward_op(
            &[vec![n]],
            OpKind::Pad { lower: vec![1], upper: vec![2] },
        );
        check_wiring(&graph, op);

        let (graph, op) = forward_op(&[vec![n], vec![m]], OpKind::Concat { axis: 0 });
        check_wiring(&graph, op);
    }
}
