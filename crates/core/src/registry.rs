use std::sync::{Arc, OnceLock, RwLock};

use indexmap::IndexMap;

use crate::descriptor::{OpMetaInfo, RETURN_OUTPUT_NAME};
use crate::error::{Result, WorkflowError};
use crate::monitor::Monitor;
use crate::types::Value;

/// Callable body of a registered operation. Receives the validated input
/// values and a progress monitor; named-output operations return an object
/// mapping output names to values.
pub type OpFn =
    dyn Fn(&IndexMap<String, Value>, &dyn Monitor) -> anyhow::Result<Value> + Send + Sync;

/// A registered operation: the callable plus its meta-information.
#[derive(Clone)]
pub struct Operation {
    meta: OpMetaInfo,
    func: Arc<OpFn>,
}

impl Operation {
    pub fn new<F>(meta: OpMetaInfo, func: F) -> Self
    where
        F: Fn(&IndexMap<String, Value>, &dyn Monitor) -> anyhow::Result<Value>
            + Send
            + Sync
            + 'static,
    {
        Self {
            meta,
            func: Arc::new(func),
        }
    }

    pub fn meta(&self) -> &OpMetaInfo {
        &self.meta
    }

    pub fn qualified_name(&self) -> &str {
        self.meta.qualified_name()
    }

    /// Perform the operation: apply declared defaults to missing inputs,
    /// validate, invoke the callable, and normalize the result against the
    /// declared outputs.
    pub fn call(
        &self,
        input_values: IndexMap<String, Value>,
        monitor: &dyn Monitor,
    ) -> Result<Value> {
        self.call_with_meta(&self.meta, input_values, monitor)
    }

    /// Like `call`, but defaults and validation come from `meta` instead of
    /// the registered meta-information. Steps pass their own meta here, which
    /// may declare ports beyond the registered ones.
    pub fn call_with_meta(
        &self,
        meta: &OpMetaInfo,
        mut input_values: IndexMap<String, Value>,
        monitor: &dyn Monitor,
    ) -> Result<Value> {
        meta.set_default_input_values(&mut input_values);
        meta.validate_input_values(&input_values)?;

        let return_value = (self.func)(&input_values, monitor)
            .map_err(|e| WorkflowError::from_op_error(self.qualified_name(), e))?;

        if meta.has_named_outputs() {
            let mut outputs = match return_value {
                Value::Object(entries) => entries,
                other => {
                    return Err(WorkflowError::OperationFailed {
                        step_id: self.qualified_name().to_string(),
                        source: anyhow::anyhow!(
                            "operation declares named outputs but returned a {} value",
                            other.type_label()
                        ),
                    })
                }
            };
            for (name, props) in meta.outputs() {
                if outputs.get(name).map(Value::is_missing).unwrap_or(true) {
                    outputs.insert(name.clone(), props.default_value());
                }
            }
            Ok(Value::Object(outputs))
        } else if return_value.is_missing() {
            let props = &meta.outputs()[RETURN_OUTPUT_NAME];
            Ok(props.default_value())
        } else {
            Ok(return_value)
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation({:?})", self.qualified_name())
    }
}

/// Maps qualified operation names to registered operations.
#[derive(Debug, Default)]
pub struct OpRegistry {
    ops: IndexMap<String, Operation>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_op(&mut self, op: Operation, fail_if_exists: bool) -> Result<()> {
        let name = op.qualified_name().to_string();
        if self.ops.contains_key(&name) {
            if fail_if_exists {
                return Err(WorkflowError::DuplicateOperation(name));
            }
            return Ok(());
        }
        self.ops.insert(name, op);
        Ok(())
    }

    pub fn get_op(&self, name: &str) -> Option<&Operation> {
        self.ops.get(name)
    }

    pub fn require_op(&self, name: &str) -> Result<&Operation> {
        self.get_op(name)
            .ok_or_else(|| WorkflowError::UnknownOperation(name.to_string()))
    }

    pub fn remove_op(&mut self, name: &str, fail_if_not_exists: bool) -> Result<Option<Operation>> {
        match self.ops.shift_remove(name) {
            Some(op) => Ok(Some(op)),
            None if fail_if_not_exists => Err(WorkflowError::UnknownOperation(name.to_string())),
            None => Ok(None),
        }
    }

    /// All registrations, sorted by qualified name.
    pub fn op_registrations(&self) -> Vec<&Operation> {
        let mut ops: Vec<&Operation> = self.ops.values().collect();
        ops.sort_by(|a, b| a.qualified_name().cmp(b.qualified_name()));
        ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

static DEFAULT_REGISTRY: OnceLock<RwLock<OpRegistry>> = OnceLock::new();

/// The process-wide default registry. Registrations happen at startup;
/// every API that consumes a registry also accepts an explicit one.
pub fn default_registry() -> &'static RwLock<OpRegistry> {
    DEFAULT_REGISTRY.get_or_init(|| RwLock::new(OpRegistry::new()))
}
