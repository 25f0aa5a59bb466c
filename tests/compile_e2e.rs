//! End-to-end compiles through the session driver, checked against the
//! reference interpreter: schedules respect dataflow, training grows a
//! working update step, and the whole pipeline is deterministic.

use std::collections::BTreeMap;

use faraday::ir::builder::{AttrValue, ModelDesc, NodeDesc, OpRegistry};
use faraday::ir::graph::AnchorReturnType;
use faraday::ir::interpreter::evaluate;
use faraday::ir::lowering::LoweredWork;
use faraday::ir::session::{compile, CompileRequest, TrainConfig};
use faraday::ir::tensor::{DType, TensorData, TensorInfo};

fn f32_info(shape: &[usize]) -> TensorInfo {
    TensorInfo::new(DType::F32, shape.to_vec())
}

fn training_model() -> ModelDesc {
    ModelDesc {
        inputs: vec![("x".to_string(), f32_info(&[4]))],
        variables: vec![(
            "w".to_string(),
            f32_info(&[4]),
            TensorData::F32(vec![1.0, 2.0, 3.0, 4.0]),
        )],
        nodes: vec![
            NodeDesc::new("Mul", "mul0").with_io(
                vec!["x".to_string(), "w".to_string()],
                vec!["wx".to_string()],
            ),
            NodeDesc::new("Relu", "relu0")
                .with_io(vec!["wx".to_string()], vec!["act".to_string()]),
            NodeDesc::new("L1Loss", "loss0")
                .with_io(vec!["act".to_string()], vec!["loss".to_string()])
                .with_attr("lambda", AttrValue::Float(0.1)),
        ],
        ..ModelDesc::default()
    }
}

/// Position of each op's grow item in the schedule, and of each
/// tensor's init or stream item.
fn schedule_positions(
    schedule: &[LoweredWork],
) -> (BTreeMap<String, usize>, BTreeMap<faraday::ir::op::OpId, usize>) {
    let mut tensor_pos = BTreeMap::new();
    let mut op_pos = BTreeMap::new();
    for (i, work) in schedule.iter().enumerate() {
        match work {
            LoweredWork::InitTensor { tensor } | LoweredWork::StreamSetup { tensor } => {
                tensor_pos.insert(tensor.clone(), i);
            }
            LoweredWork::GrowOp { op } => {
                op_pos.insert(*op, i);
            }
        }
    }
    (tensor_pos, op_pos)
}

#[test]
fn the_schedule_respects_dataflow() {
    let request = CompileRequest {
        anchors: vec![("loss".to_string(), AnchorReturnType::All)],
        train: Some(TrainConfig {
            loss: "loss".to_string(),
            lr: 0.01,
        }),
        ..CompileRequest::default()
    };
    let session = compile(&training_model(), &OpRegistry::with_builtins(), &request)
        .expect("compile must succeed");

    let (tensor_pos, op_pos) = schedule_positions(&session.program.schedule);
    for op_id in session.graph.op_ids() {
        let op = session.graph.op(op_id).expect("op must exist");
        let here = op_pos[&op_id];
        for input in op.inputs.values() {
            let producer = session
                .graph
                .tensor(input)
                .expect("tensor must exist")
                .producer;
            let input_ready = match producer {
                Some(p) => op_pos[&p],
                None => tensor_pos[input],
            };
            assert!(
                input_ready < here,
                "{} grows before its input `{input}` is ready",
                op.debug_name()
            );
        }
    }
}

#[test]
fn contracts_cover_every_op_in_schedule_order() {
    let request = CompileRequest {
        anchors: vec![("act".to_string(), AnchorReturnType::All)],
        ..CompileRequest::default()
    };
    let session = compile(&training_model(), &OpRegistry::with_builtins(), &request)
        .expect("compile must succeed");

    let grown: Vec<_> = session
        .program
        .schedule
        .iter()
        .filter_map(|work| match work {
            LoweredWork::GrowOp { op } => Some(*op),
            _ => None,
        })
        .collect();
    let contracted: Vec<_> = session.program.contracts.iter().map(|c| c.op).collect();
    assert_eq!(grown, contracted);
    assert!(session.program.anchors.contains_key("act"));
}

#[test]
fn one_sgd_step_moves_weights_against_the_gradient() {
    let request = CompileRequest {
        anchors: vec![("loss".to_string(), AnchorReturnType::All)],
        train: Some(TrainConfig {
            loss: "loss".to_string(),
            lr: 0.01,
        }),
        ..CompileRequest::default()
    };
    let session = compile(&training_model(), &OpRegistry::with_builtins(), &request)
        .expect("compile must succeed");

    let update = session.graph.ops_of_type("SgdVarUpdate");
    assert_eq!(update.len(), 1);
    let updated_id = session
        .graph
        .op(update[0])
        .expect("op must exist")
        .output_id(0)
        .expect("update must have an output")
        .clone();

    let feeds = BTreeMap::from([(
        "x".to_string(),
        TensorData::F32(vec![1.0, 1.0, 1.0, 1.0]),
    )]);
    let values = evaluate(&session.graph, &feeds).expect("evaluation must succeed");

    // loss = 0.1 * sum|relu(w * x)|; with x all-ones and w positive the
    // gradient w.r.t. each weight is 0.1, so one step subtracts lr * 0.1.
    let TensorData::F32(updated) = &values[&updated_id] else {
        panic!("updated weights must be f32");
    };
    for (before, after) in [1.0f32, 2.0, 3.0, 4.0].iter().zip(updated) {
        assert!((after - (before - 0.001)).abs() <= 1e-6);
    }

    let TensorData::F32(loss) = &values["loss"] else {
        panic!("loss must be f32");
    };
    assert!((loss[0] - 1.0).abs() <= 1e-5);
}

#[test]
fn compiling_twice_yields_the_same_schedule() {
    let request = CompileRequest {
        anchors: vec![("loss".to_string(), AnchorReturnType::All)],
        train: Some(TrainConfig {
            loss: "loss".to_string(),
            lr: 0.01,
        }),
        ..CompileRequest::default()
    };
    let first = compile(&training_model(), &OpRegistry::with_builtins(), &request)
        .expect("compile must succeed");
    let second = compile(&training_model(), &OpRegistry::with_builtins(), &request)
        .expect("compile must succeed");
    assert_eq!(first.program.schedule, second.program.schedule);
}
