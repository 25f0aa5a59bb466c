use thiserror::Error;

/// Coarse classification of a failure, used by callers to decide whether
/// the input model is at fault, the compiler itself is, or an attached
/// backend reported something the compiler passes through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Model,
    Internal,
    Backend,
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    Model(String),

    #[error("No ConstExpr implementation of {op_type} (op `{name}`)")]
    NoConstExprImpl { op_type: String, name: String },

    #[error("op {op_type} (`{name}`) belongs to a class that is never constant-folded")]
    NeverFoldable { op_type: String, name: String },

    #[error("cannot grow gradient of {op_type} (op `{name}`): no gradient implementation")]
    NoGradImpl { op_type: String, name: String },

    #[error("ILE: {0}")]
    Internal(String),

    #[error("ILE: task {dependent} depends on {dep}, which was never added")]
    UnresolvedTask { dep: String, dependent: String },

    #[error("backend: {0}")]
    Backend(String),
}

impl CompileError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            CompileError::Model(_)
            | CompileError::NoConstExprImpl { .. }
            | CompileError::NeverFoldable { .. }
            | CompileError::NoGradImpl { .. } => ErrorCategory::Model,
            CompileError::Internal(_) | CompileError::UnresolvedTask { .. } => {
                ErrorCategory::Internal
            }
            CompileError::Backend(_) => ErrorCategory::Backend,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

/// Shorthand for model-level failures raised from deep inside a pass.
pub fn model_error(message: impl Into<String>) -> CompileError {
    CompileError::Model(message.into())
}

/// Shorthand for internal logic errors. These indicate a compiler bug,
/// never a malformed input model.
pub fn internal_error(message: impl Into<String>) -> CompileError {
    CompileError::Internal(message.into())
}
