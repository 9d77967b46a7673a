use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};
use crate::types::{DataType, Value};

/// Name of the input that receives the progress monitor.
pub const MONITOR_INPUT_NAME: &str = "monitor";

/// Name of the single, unnamed output of an operation.
pub const RETURN_OUTPUT_NAME: &str = "return";

/// Header flag that disables value caching for an operation when `false`.
pub const CAN_CACHE_HEADER_KEY: &str = "can_cache";

/// How an input sources its value from the execution context, if at all.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextSpec {
    None,
    /// `"context": true` — the whole context object is injected.
    Whole,
    /// `"context": "<expression>"` — evaluated over the context; failures
    /// degrade to null.
    Expression(String),
}

/// Declared properties of a single input or output port.
///
/// Recognized keys are typed; anything else an operation declares rides along
/// in `extra` and round-trips untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortProps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_set: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_range: Option<(serde_json::Value, serde_json::Value)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_from: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

impl PortProps {
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(false)
    }

    pub fn default_value(&self) -> Value {
        self.default_value
            .as_ref()
            .map(Value::from_json)
            .unwrap_or(Value::Null)
    }

    pub fn has_default(&self) -> bool {
        self.default_value.is_some()
    }

    pub fn context_spec(&self) -> ContextSpec {
        match &self.context {
            Some(serde_json::Value::String(expr)) => ContextSpec::Expression(expr.clone()),
            Some(value) if value.as_bool() == Some(true) => ContextSpec::Whole,
            _ => ContextSpec::None,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == PortProps::default()
    }

    /// Overlay `other` onto this property set: present fields win, extras
    /// are merged key-by-key.
    pub fn merge(&mut self, other: PortProps) {
        if other.data_type.is_some() {
            self.data_type = other.data_type;
        }
        if other.default_value.is_some() {
            self.default_value = other.default_value;
        }
        if other.required.is_some() {
            self.required = other.required;
        }
        if other.value_set.is_some() {
            self.value_set = other.value_set;
        }
        if other.value_range.is_some() {
            self.value_range = other.value_range;
        }
        if other.context.is_some() {
            self.context = other.context;
        }
        if other.write_to.is_some() {
            self.write_to = other.write_to;
        }
        if other.read_from.is_some() {
            self.read_from = other.read_from;
        }
        self.extra.extend(other.extra);
    }
}

/// Meta-information about an operation: its qualified name, free-form header,
/// and ordered input/output descriptors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpMetaInfo {
    qualified_name: String,
    header: IndexMap<String, serde_json::Value>,
    inputs: IndexMap<String, PortProps>,
    outputs: IndexMap<String, PortProps>,
}

impl OpMetaInfo {
    pub fn new(qualified_name: &str) -> Self {
        Self {
            qualified_name: qualified_name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.header.insert(
            "description".to_string(),
            serde_json::Value::String(description.to_string()),
        );
        self
    }

    pub fn with_header_entry(mut self, key: &str, value: serde_json::Value) -> Self {
        self.header.insert(key.to_string(), value);
        self
    }

    pub fn with_input(mut self, name: &str, props: PortProps) -> Self {
        self.inputs.insert(name.to_string(), props);
        self
    }

    pub fn with_output(mut self, name: &str, props: PortProps) -> Self {
        self.outputs.insert(name.to_string(), props);
        self
    }

    pub fn with_return_output(self) -> Self {
        self.with_output(RETURN_OUTPUT_NAME, PortProps::default())
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn set_qualified_name(&mut self, name: &str) {
        self.qualified_name = name.to_string();
    }

    pub fn header(&self) -> &IndexMap<String, serde_json::Value> {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut IndexMap<String, serde_json::Value> {
        &mut self.header
    }

    pub fn inputs(&self) -> &IndexMap<String, PortProps> {
        &self.inputs
    }

    pub fn inputs_mut(&mut self) -> &mut IndexMap<String, PortProps> {
        &mut self.inputs
    }

    pub fn outputs(&self) -> &IndexMap<String, PortProps> {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut IndexMap<String, PortProps> {
        &mut self.outputs
    }

    /// Make sure at least the single unnamed output exists.
    pub fn ensure_return_output(&mut self) {
        if self.outputs.is_empty() {
            self.outputs
                .insert(RETURN_OUTPUT_NAME.to_string(), PortProps::default());
        }
    }

    /// Whether the operation declares an input named `monitor`.
    pub fn has_monitor(&self) -> bool {
        self.inputs.contains_key(MONITOR_INPUT_NAME)
    }

    /// Whether the outputs are anything other than exactly the single
    /// unnamed `return` output.
    pub fn has_named_outputs(&self) -> bool {
        !(self.outputs.len() == 1 && self.outputs.contains_key(RETURN_OUTPUT_NAME))
    }

    /// Whether results of this operation may be memoized in the value cache.
    /// Caching is opt-out via the `can_cache` header flag.
    pub fn can_cache(&self) -> bool {
        self.header
            .get(CAN_CACHE_HEADER_KEY)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true)
    }

    /// Fill every declared input missing from `input_values` with its
    /// default, or null when no default is declared.
    pub fn set_default_input_values(&self, input_values: &mut IndexMap<String, Value>) {
        for (name, props) in &self.inputs {
            if name == MONITOR_INPUT_NAME {
                continue;
            }
            if !input_values.contains_key(name) {
                input_values.insert(name.clone(), props.default_value());
            }
        }
    }

    /// Validate `input_values` against the declared input constraints.
    pub fn validate_input_values(&self, input_values: &IndexMap<String, Value>) -> Result<()> {
        for (name, value) in input_values {
            if name == MONITOR_INPUT_NAME {
                continue;
            }
            let props = self.inputs.get(name).ok_or_else(|| {
                WorkflowError::InvalidEncoding(format!(
                    "'{name}' is not an input of operation '{}'",
                    self.qualified_name
                ))
            })?;

            if value.is_missing() {
                if props.is_required() {
                    return Err(WorkflowError::MissingInput {
                        op: self.qualified_name.clone(),
                        name: name.clone(),
                    });
                }
                continue;
            }

            if let Some(data_type) = &props.data_type {
                if !data_type.accepts(value) {
                    return Err(WorkflowError::TypeMismatch {
                        op: self.qualified_name.clone(),
                        name: name.clone(),
                        expected: data_type.qualified_name().to_string(),
                    });
                }
            }

            if let Some(value_set) = &props.value_set {
                let allowed = value_set.iter().any(|json| Value::from_json(json) == *value);
                if !allowed {
                    return Err(WorkflowError::ValueNotInSet {
                        op: self.qualified_name.clone(),
                        name: name.clone(),
                    });
                }
            }

            if let Some((low, high)) = &props.value_range {
                let low = Value::from_json(low);
                let high = Value::from_json(high);
                let in_range = matches!(
                    value.compare(&low),
                    Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                ) && matches!(
                    value.compare(&high),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                );
                if !in_range {
                    return Err(WorkflowError::ValueOutOfRange {
                        op: self.qualified_name.clone(),
                        name: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
