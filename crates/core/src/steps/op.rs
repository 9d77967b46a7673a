use indexmap::IndexMap;

use crate::descriptor::OpMetaInfo;
use crate::error::Result;
use crate::monitor::Monitor;
use crate::registry::Operation;
use crate::types::Value;

/// Step that invokes a registered operation.
#[derive(Debug, Clone)]
pub struct OpStep {
    op: Operation,
}

impl OpStep {
    pub fn new(op: Operation) -> Self {
        Self { op }
    }

    pub fn op(&self) -> &Operation {
        &self.op
    }

    /// `meta` is the step's meta-information, which may extend the
    /// registered one with ports declared in serialized form.
    pub(crate) fn invoke(
        &self,
        meta: &OpMetaInfo,
        input_values: IndexMap<String, Value>,
        monitor: &dyn Monitor,
    ) -> Result<Value> {
        self.op.call_with_meta(meta, input_values, monitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{OpMetaInfo, PortProps};
    use crate::monitor::NullMonitor;
    use crate::types::DataType;

    #[test]
    fn test_op_step_invokes_operation() {
        let meta = OpMetaInfo::new("test.inc")
            .with_input(
                "x",
                PortProps {
                    data_type: Some(DataType::Int),
                    ..Default::default()
                },
            )
            .with_return_output();
        let step = OpStep::new(Operation::new(meta, |inputs, _monitor| {
            Ok(Value::Int(inputs["x"].as_i64().unwrap_or(0) + 1))
        }));

        let mut inputs = IndexMap::new();
        inputs.insert("x".to_string(), Value::Int(6));
        let result = step
            .invoke(step.op().meta(), inputs, &NullMonitor)
            .expect("op step should invoke");
        assert_eq!(result, Value::Int(7));
        assert_eq!(step.op().qualified_name(), "test.inc");
    }
}
