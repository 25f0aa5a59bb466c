//! # Faraday
//!
//! A compiler middle end for dataflow graphs of tensor ops: typed
//! graph construction, reverse-mode autodiff, pattern rewrites with
//! alias-aware inplacing, partition/pipeline/recompute transforms, and
//! lowering to a deterministic linear program.
//!
//! ## Pipeline
//!
//! ```text
//! ModelDesc
//!    │
//!    ▼  builder::build_graph
//! ir::Graph
//!    │
//!    ▼  constexpr::fold_constants
//!    ▼  autograd::grow_backward        (training only)
//!    ▼  patterns::apply_patterns       (identities, fusion, inplacing)
//!    ▼  transforms::run_transforms     (partition, pipeline, recompute,
//!    │                                  copy merging)
//!    ▼  lowering::lower
//! CompiledProgram
//!    │
//!    ▼  lowering::emit_to_backend
//! Backend side effects
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use faraday::ir::builder::OpRegistry;
//! use faraday::ir::graph::AnchorReturnType;
//! use faraday::ir::session::{compile, CompileRequest};
//!
//! let model = faraday::ir::builder::ModelDesc::default();
//! let request = CompileRequest::default();
//! let session = compile(&model, &OpRegistry::with_builtins(), &request).unwrap();
//! for work in &session.program.schedule {
//!     println!("{work:?}");
//! }
//! ```

#![allow(
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::unused_self,
    clippy::uninlined_format_args,
    clippy::too_many_lines,
    clippy::match_same_arms,
    clippy::manual_let_else,
    clippy::needless_pass_by_value,
    clippy::implicit_hasher,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::unnecessary_wraps,
    clippy::missing_panics_doc,
    clippy::needless_continue,
    clippy::similar_names,
    clippy::doc_markdown,
    clippy::items_after_statements
)]

pub mod error;
pub mod ir;
pub mod region;

pub use error::{CompileError, ErrorCategory, Result};
