use crate::op::OperandRole;
use crate::shape::Shape;

/// All errors that can occur within primnet.
///
/// The first three variants follow the failure taxonomy of graph assembly and
/// execution: a bad operator configuration, a failed allocation, or a step that
/// failed while the graph was being replayed. None of them is recoverable for
/// the call in progress.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid shape/stride/padding/operator combination, detected when the
    /// operator descriptor or one of its primitives is created.
    #[error("invalid {op} configuration: {reason}")]
    Config { op: String, reason: String },

    /// A scratch buffer, workspace or primitive could not be allocated.
    #[error("resource error for {role}: {reason}")]
    Resource { role: OperandRole, reason: String },

    /// A step of an assembled kernel graph failed during replay.
    #[error("step {step} ({label}) failed: {source}")]
    Execution {
        step: usize,
        label: String,
        #[source]
        source: Box<Error>,
    },

    /// Shape mismatch between a layout and the operand it is bound to.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// A caller buffer is shorter than the layout it is bound under.
    #[error("{role} buffer too small: layout needs {needed} elements, got {got}")]
    BufferTooSmall {
        role: OperandRole,
        needed: usize,
        got: usize,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Configuration error for the operator named by `op`.
    pub fn config(op: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Error::Config {
            op: op.to_string(),
            reason: reason.into(),
        }
    }

    /// Resource error for the operand playing `role`.
    pub fn resource(role: OperandRole, reason: impl Into<String>) -> Self {
        Error::Resource {
            role,
            reason: reason.into(),
        }
    }

    /// Wrap `self` as the failure of step `step`.
    pub fn in_step(self, step: usize, label: impl Into<String>) -> Self {
        Error::Execution {
            step,
            label: label.into(),
            source: Box::new(self),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config { .. })
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, Error::Resource { .. })
    }

    pub fn is_execution(&self) -> bool {
        matches!(self, Error::Execution { .. })
    }
}

/// Convenience Result type used throughout primnet.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
