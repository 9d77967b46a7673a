use std::rc::Rc;

use indexmap::IndexMap;

use crate::cache::ValueCache;
use crate::descriptor::{ContextSpec, OpMetaInfo};
use crate::error::Result;
use crate::expr::{DefaultEvaluator, ExpressionEvaluator};
use crate::monitor::{Monitor, NullMonitor};
use crate::types::Value;
use crate::workflow::Workflow;

/// Execution state threaded through an invocation tree: free-form context
/// entries, the value cache, the progress monitor, and the expression
/// evaluator. Nested scopes are built copy-on-descend with individual fields
/// overridden (a sub-workflow descends with its own child cache).
pub struct ExecutionContext<'a> {
    /// Context entries visible to context-derived inputs. The engine adds
    /// `step_id` and `workflow_id` for the node being invoked.
    pub values: IndexMap<String, Value>,
    pub cache: Option<&'a mut ValueCache>,
    pub monitor: Rc<dyn Monitor>,
    pub evaluator: Rc<dyn ExpressionEvaluator>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new() -> Self {
        Self {
            values: IndexMap::new(),
            cache: None,
            monitor: Rc::new(NullMonitor),
            evaluator: Rc::new(DefaultEvaluator),
        }
    }

    pub fn with_cache(cache: &'a mut ValueCache) -> Self {
        Self {
            cache: Some(cache),
            ..Self::new()
        }
    }

    pub fn monitor(mut self, monitor: Rc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn evaluator(mut self, evaluator: Rc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn value(mut self, key: &str, value: Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }
}

impl Default for ExecutionContext<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Set context-derived inputs: a `"context"` property of `true` injects the
/// whole context object, an expression text is evaluated over the context.
/// Expression failures degrade to null so contextual fields stay best-effort.
pub(crate) fn apply_context_inputs(
    meta: &OpMetaInfo,
    context_values: &IndexMap<String, Value>,
    evaluator: &dyn ExpressionEvaluator,
    input_values: &mut IndexMap<String, Value>,
) {
    for (name, props) in meta.inputs() {
        match props.context_spec() {
            ContextSpec::None => {}
            ContextSpec::Whole => {
                input_values.insert(name.clone(), Value::Object(context_values.clone()));
            }
            ContextSpec::Expression(expression) => {
                let value = evaluator
                    .eval(&expression, context_values)
                    .unwrap_or(Value::Null);
                input_values.insert(name.clone(), value);
            }
        }
    }
}

/// Build an execution context over `cache` and call the workflow with the
/// given input values. This is the plain entry point for embedders that do
/// not need custom context entries.
pub fn run_workflow(
    workflow: &mut Workflow,
    input_values: IndexMap<String, Value>,
    cache: &mut ValueCache,
    monitor: Rc<dyn Monitor>,
) -> Result<Value> {
    let mut ctx = ExecutionContext::with_cache(cache).monitor(monitor);
    workflow.call(&mut ctx, input_values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PortProps;

    fn meta_with_context_input(context: serde_json::Value) -> OpMetaInfo {
        OpMetaInfo::new("test.ctx")
            .with_input(
                "ctx_input",
                PortProps {
                    context: Some(context),
                    ..Default::default()
                },
            )
            .with_return_output()
    }

    #[test]
    fn test_whole_context_injection() {
        let meta = meta_with_context_input(serde_json::json!(true));
        let mut context_values = IndexMap::new();
        context_values.insert("base_dir".to_string(), Value::Str("/ws".to_string()));

        let mut input_values = IndexMap::new();
        apply_context_inputs(&meta, &context_values, &DefaultEvaluator, &mut input_values);

        assert_eq!(
            input_values.get("ctx_input"),
            Some(&Value::Object(context_values))
        );
    }

    #[test]
    fn test_context_expression_injection() {
        let meta = meta_with_context_input(serde_json::json!("count + 1"));
        let mut context_values = IndexMap::new();
        context_values.insert("count".to_string(), Value::Int(2));

        let mut input_values = IndexMap::new();
        apply_context_inputs(&meta, &context_values, &DefaultEvaluator, &mut input_values);

        assert_eq!(input_values.get("ctx_input"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_failing_context_expression_degrades_to_null() {
        let meta = meta_with_context_input(serde_json::json!("missing_name"));

        let mut input_values = IndexMap::new();
        apply_context_inputs(
            &meta,
            &IndexMap::new(),
            &DefaultEvaluator,
            &mut input_values,
        );

        assert_eq!(input_values.get("ctx_input"), Some(&Value::Null));
    }

    #[test]
    fn test_context_builder() {
        let ctx = ExecutionContext::new().value("k", Value::Int(1));
        assert_eq!(ctx.values.get("k"), Some(&Value::Int(1)));
        assert!(ctx.cache.is_none());
        assert!(!ctx.monitor.is_cancelled());
    }
}
