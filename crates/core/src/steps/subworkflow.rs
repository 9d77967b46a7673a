use indexmap::IndexMap;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::types::Value;
use crate::workflow::Workflow;

/// Step that invokes a nested workflow loaded from an external resource.
///
/// The nested workflow runs in a descended context whose value cache is the
/// parent cache's child scope for this step's id, so its memoized values
/// never collide with identically-named steps of the outer workflow. When
/// this step's `can_cache` flag is off, the nested workflow runs with no
/// cache at all.
#[derive(Debug, Clone)]
pub struct WorkflowStep {
    workflow: Workflow,
    resource: String,
}

impl WorkflowStep {
    pub fn new(workflow: Workflow, resource: &str) -> Self {
        Self {
            workflow,
            resource: resource.to_string(),
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn workflow_mut(&mut self) -> &mut Workflow {
        &mut self.workflow
    }

    /// The resource locator (file path, URL) the workflow was loaded from.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub(crate) fn invoke(
        &mut self,
        step_id: &str,
        can_cache: bool,
        input_values: IndexMap<String, Value>,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<IndexMap<String, Value>> {
        // Feed the gathered step inputs into the nested workflow's inputs.
        for (name, value) in input_values {
            if let Some(port) = self.workflow.input_mut(&name) {
                port.set_value(value);
            }
        }

        let cache = if can_cache {
            ctx.cache.as_deref_mut().map(|cache| cache.child(step_id))
        } else {
            None
        };
        let mut inner_ctx = ExecutionContext {
            values: ctx.values.clone(),
            cache,
            monitor: ctx.monitor.clone(),
            evaluator: ctx.evaluator.clone(),
        };
        self.workflow.invoke(&mut inner_ctx)?;

        // Transfer the nested workflow's output values onto this step.
        let mut outputs = IndexMap::new();
        for name in self.workflow.output_names() {
            outputs.insert(name.clone(), self.workflow.output_value(&name));
        }
        Ok(outputs)
    }
}
