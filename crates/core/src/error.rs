use thiserror::Error;

/// Errors surfaced by workflow construction, resolution, and execution.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("step #{index} has no recognized step kind")]
    UnknownStepKind { index: usize },

    #[error("cannot connect '{port}' with node '{node_id}' because node '{node_id}' does not exist")]
    UnknownNode { port: String, node_id: String },

    #[error("cannot connect '{port}' with '{node_id}.{name}' because node '{node_id}' has no input/output named '{name}'")]
    UnknownPort {
        port: String,
        node_id: String,
        name: String,
    },

    #[error("cannot connect '{port}' with '.{name}' because '{name}' does not exist in any scope")]
    UnknownPortInScope { port: String, name: String },

    #[error("cannot connect '{port}' with node '{node_id}' because it has {output_count} named outputs")]
    AmbiguousNode {
        port: String,
        node_id: String,
        output_count: usize,
    },

    #[error("step '{0}' already exists")]
    DuplicateStepId(String),

    #[error("step '{0}' not found")]
    UnknownStep(String),

    #[error("operation '{0}' already registered")]
    DuplicateOperation(String),

    #[error("operation '{0}' not registered")]
    UnknownOperation(String),

    #[error("cycle detected in workflow '{0}'")]
    CyclicGraph(String),

    #[error("input '{name}' for operation '{op}' required")]
    MissingInput { op: String, name: String },

    #[error("input '{name}' for operation '{op}' must be of type {expected}")]
    TypeMismatch {
        op: String,
        name: String,
        expected: String,
    },

    #[error("input '{name}' for operation '{op}' must be one of the declared value set")]
    ValueNotInSet { op: String, name: String },

    #[error("input '{name}' for operation '{op}' must be in the declared value range")]
    ValueOutOfRange { op: String, name: String },

    #[error("cannot connect '{0}' with itself")]
    SelfBinding(String),

    #[error("sub-process '{command}' failed: {reason}")]
    SubprocessFailed { command: String, reason: String },

    #[error("execution canceled")]
    Canceled,

    #[error("step '{step_id}' failed: {source}")]
    OperationFailed {
        step_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WorkflowError {
    /// Re-attribute an operation failure to the step it happened in.
    pub fn at_step(self, step_id: &str) -> Self {
        match self {
            Self::OperationFailed { source, .. } => Self::OperationFailed {
                step_id: step_id.to_string(),
                source,
            },
            other => other,
        }
    }

    /// Wrap an arbitrary operation error, preserving cancellation.
    pub fn from_op_error(step_id: &str, error: anyhow::Error) -> Self {
        match error.downcast::<WorkflowError>() {
            Ok(WorkflowError::Canceled) => WorkflowError::Canceled,
            Ok(other) => other.at_step(step_id),
            Err(error) => WorkflowError::OperationFailed {
                step_id: step_id.to_string(),
                source: error,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
