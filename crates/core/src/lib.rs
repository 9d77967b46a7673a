//! Core engine for constructing, serializing, and executing workflows:
//! directed acyclic graphs of steps whose output ports feed other steps'
//! input ports. Workflows are themselves steps, enabling hierarchical
//! composition.

pub mod cache;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod expr;
pub mod monitor;
pub mod node;
pub mod registry;
pub mod steps;
pub mod types;
pub mod workflow;

pub use cache::ValueCache;
pub use context::{run_workflow, ExecutionContext};
pub use descriptor::{OpMetaInfo, PortProps, MONITOR_INPUT_NAME, RETURN_OUTPUT_NAME};
pub use error::{Result, WorkflowError};
pub use expr::{DefaultEvaluator, ExpressionEvaluator};
pub use monitor::{ChildMonitor, Monitor, NullMonitor};
pub use node::{NodeCore, NodePort, PortLoc, PortSpace, SourceRef};
pub use registry::{default_registry, OpRegistry, Operation};
pub use steps::{ExpressionStep, NoOpStep, OpStep, Step, StepKind, SubProcessStep, WorkflowStep};
pub use types::{DataType, OpaqueHandle, OpaquePayload, Value};
pub use workflow::{Workflow, WORKFLOW_SCHEMA_VERSION};
