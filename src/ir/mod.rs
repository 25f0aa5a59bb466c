pub mod autograd;
pub mod builder;
pub mod constexpr;
pub mod graph;
pub mod inplace;
pub mod interpreter;
pub mod lowering;
pub mod op;
pub mod patterns;
pub mod scheduler;
pub mod session;
pub mod tensor;
pub mod transforms;

pub use autograd::{apply_sgd, grad_defs, grow_backward, GradInOutMapper, GradOpDef, GradOpInType, Gradients};
pub use builder::{build_graph, AttrValue, ModelDesc, NodeDesc, OpRegistry};
pub use constexpr::{default_non_const_sources, fold_constants, ConstExprClassifier};
pub use graph::{AnchorReturnType, Graph};
pub use inplace::InplacePattern;
pub use interpreter::{eval_op, evaluate};
pub use lowering::{
    emit_to_backend, lower, BackendFault, CompiledProgram, LoweredWork, LoweringBackend,
    OpContract, SchedulePriorities,
};
pub use op::{Op, OpId, OpKind, OpSettings, Phase, RecomputeKind, Slices};
pub use patterns::{
    apply_patterns, IdentityRemovalPattern, OpToIdentityPattern, Pattern, PatternConfig,
    PatternRegistry, ScaleFusionPattern,
};
pub use scheduler::{verify_order, PriTask, PriTasks, TaskId};
pub use session::{compile, compile_graph, CompileRequest, CompiledSession, TrainConfig};
pub use tensor::{DType, Tensor, TensorData, TensorId, TensorInfo, TensorKind};
pub use transforms::{run_transforms, Transform, TransformConfig};
