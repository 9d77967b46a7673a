use indexmap::IndexMap;

use crate::descriptor::OpMetaInfo;
use crate::error::{Result, WorkflowError};
use crate::expr::ExpressionEvaluator;
use crate::types::Value;

/// Step whose result is an expression evaluated over its current input
/// values. The underlying operation is synthesized from the declared
/// inputs/outputs and the expression text.
#[derive(Debug, Clone)]
pub struct ExpressionStep {
    expression: String,
}

impl ExpressionStep {
    pub fn new(expression: &str) -> Self {
        Self {
            expression: expression.to_string(),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub(crate) fn invoke(
        &self,
        meta: &OpMetaInfo,
        mut input_values: IndexMap<String, Value>,
        evaluator: &dyn ExpressionEvaluator,
    ) -> Result<Value> {
        meta.set_default_input_values(&mut input_values);
        meta.validate_input_values(&input_values)?;
        evaluator
            .eval(&self.expression, &input_values)
            .map_err(|e| WorkflowError::from_op_error(meta.qualified_name(), e))
    }
}
