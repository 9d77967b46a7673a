//! Step variants: the leaf computations a workflow is composed of.
//!
//! A step is a node with an identifier, operation meta-information, and
//! ports, plus a kind-specific payload. Dispatch is a plain match on the
//! kind; there is no inheritance.

pub mod expression;
pub mod noop;
pub mod op;
pub mod subprocess;
pub mod subworkflow;

use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use uuid::Uuid;

pub use expression::ExpressionStep;
pub use noop::NoOpStep;
pub use op::OpStep;
pub use subprocess::SubProcessStep;
pub use subworkflow::WorkflowStep;

use crate::context::ExecutionContext;
use crate::descriptor::{OpMetaInfo, PortProps, RETURN_OUTPUT_NAME};
use crate::error::{Result, WorkflowError};
use crate::node::{NodeCore, PortSpace};
use crate::registry::{OpRegistry, Operation};
use crate::types::Value;
use crate::workflow::Workflow;

/// Kind-specific payload of a step.
#[derive(Debug, Clone)]
pub enum StepKind {
    Op(OpStep),
    Expression(ExpressionStep),
    SubProcess(SubProcessStep),
    Workflow(WorkflowStep),
    NoOp(NoOpStep),
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Op(_) => "OpStep",
            StepKind::Expression(_) => "ExpressionStep",
            StepKind::SubProcess(_) => "SubProcessStep",
            StepKind::Workflow(_) => "WorkflowStep",
            StepKind::NoOp(_) => "NoOpStep",
        }
    }
}

/// An inner node of a workflow.
#[derive(Debug, Clone)]
pub struct Step {
    core: NodeCore,
    persistent: bool,
    kind: StepKind,
}

pub(crate) fn generated_id(kind: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{kind}_{}", &uuid[..8])
}

fn expect_text<'a>(value: &'a serde_json::Value, index: usize, field: &str) -> Result<&'a str> {
    value.as_str().ok_or_else(|| {
        WorkflowError::InvalidEncoding(format!("step #{index}: \"{field}\" is not a text"))
    })
}

impl Step {
    /// Step invoking the named operation from `registry`.
    pub fn op(op_name: &str, node_id: Option<&str>, registry: &OpRegistry) -> Result<Step> {
        let op = registry.require_op(op_name)?.clone();
        Ok(Self::from_op(op, node_id))
    }

    /// Step invoking the given operation.
    pub fn from_op(op: Operation, node_id: Option<&str>) -> Step {
        let mut meta = op.meta().clone();
        meta.ensure_return_output();
        let id = node_id
            .map(str::to_string)
            .unwrap_or_else(|| generated_id("opstep"));
        Step {
            core: NodeCore::new(&id, meta),
            persistent: false,
            kind: StepKind::Op(OpStep::new(op)),
        }
    }

    /// Expression step with no declared ports beyond the single return.
    pub fn expression(expression: &str, node_id: Option<&str>) -> Step {
        Self::expression_with_io(expression, IndexMap::new(), IndexMap::new(), node_id)
    }

    /// Expression step with declared inputs and outputs; the meta-information
    /// is synthesized from them.
    pub fn expression_with_io(
        expression: &str,
        inputs: IndexMap<String, PortProps>,
        outputs: IndexMap<String, PortProps>,
        node_id: Option<&str>,
    ) -> Step {
        let id = node_id
            .map(str::to_string)
            .unwrap_or_else(|| generated_id("expressionstep"));
        Step {
            core: NodeCore::new(&id, synthesized_meta(&id, inputs, outputs)),
            persistent: false,
            kind: StepKind::Expression(ExpressionStep::new(expression)),
        }
    }

    /// Sub-process step with no declared ports beyond the single return.
    pub fn subprocess(spec: SubProcessStep, node_id: Option<&str>) -> Step {
        Self::subprocess_with_io(spec, IndexMap::new(), IndexMap::new(), node_id)
    }

    pub fn subprocess_with_io(
        spec: SubProcessStep,
        inputs: IndexMap<String, PortProps>,
        outputs: IndexMap<String, PortProps>,
        node_id: Option<&str>,
    ) -> Step {
        let id = node_id
            .map(str::to_string)
            .unwrap_or_else(|| generated_id("subprocessstep"));
        Step {
            core: NodeCore::new(&id, synthesized_meta(&id, inputs, outputs)),
            persistent: false,
            kind: StepKind::SubProcess(spec),
        }
    }

    /// Placeholder step that computes nothing; it may still route values by
    /// binding its outputs to its inputs.
    pub fn noop(node_id: Option<&str>) -> Step {
        Self::noop_with_io(IndexMap::new(), IndexMap::new(), node_id)
    }

    pub fn noop_with_io(
        inputs: IndexMap<String, PortProps>,
        outputs: IndexMap<String, PortProps>,
        node_id: Option<&str>,
    ) -> Step {
        let id = node_id
            .map(str::to_string)
            .unwrap_or_else(|| generated_id("noopstep"));
        Step {
            core: NodeCore::new(&id, synthesized_meta(&id, inputs, outputs)),
            persistent: false,
            kind: StepKind::NoOp(NoOpStep),
        }
    }

    /// Step wrapping an externally stored workflow.
    pub fn workflow(workflow: Workflow, resource: &str, node_id: Option<&str>) -> Step {
        let meta = workflow.op_meta().clone();
        let id = node_id
            .map(str::to_string)
            .unwrap_or_else(|| generated_id("workflowstep"));
        Step {
            core: NodeCore::new(&id, meta),
            persistent: false,
            kind: StepKind::Workflow(WorkflowStep::new(workflow, resource)),
        }
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    /// Rename a detached step. Steps already added to a workflow are renamed
    /// through `Workflow::rename_node`, which cascades reference updates.
    pub fn set_id(&mut self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(WorkflowError::InvalidEncoding(
                "node id must not be empty".to_string(),
            ));
        }
        self.core.set_id(id);
        Ok(())
    }

    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    pub fn op_meta(&self) -> &OpMetaInfo {
        self.core.op_meta()
    }

    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    pub fn as_sub_workflow(&self) -> Option<&Workflow> {
        match &self.kind {
            StepKind::Workflow(step) => Some(step.workflow()),
            _ => None,
        }
    }

    pub fn as_sub_workflow_mut(&mut self) -> Option<&mut Workflow> {
        match &mut self.kind {
            StepKind::Workflow(step) => Some(step.workflow_mut()),
            _ => None,
        }
    }

    /// Invoke the step with its gathered input values and return the output
    /// values to be written into its output ports.
    pub(crate) fn invoke_impl(
        &mut self,
        input_values: IndexMap<String, Value>,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<IndexMap<String, Value>> {
        let Step { core, kind, .. } = self;
        let step_id = core.id().to_string();
        let can_cache = core.op_meta().can_cache();

        match kind {
            StepKind::NoOp(_) => Ok(IndexMap::new()),
            StepKind::Workflow(step) => step.invoke(&step_id, can_cache, input_values, ctx),
            StepKind::Op(_) | StepKind::Expression(_) | StepKind::SubProcess(_) => {
                let cached = if can_cache {
                    ctx.cache
                        .as_deref()
                        .and_then(|cache| cache.get(&step_id))
                        .filter(|value| !value.is_undefined())
                        .cloned()
                } else {
                    None
                };

                let return_value = match cached {
                    Some(value) => value,
                    None => {
                        let value = match kind {
                            StepKind::Op(step) => {
                                step.invoke(core.op_meta(), input_values, ctx.monitor.as_ref())
                            }
                            StepKind::Expression(step) => {
                                step.invoke(core.op_meta(), input_values, ctx.evaluator.as_ref())
                            }
                            StepKind::SubProcess(step) => {
                                step.invoke(core.op_meta(), input_values, ctx.monitor.as_ref())
                            }
                            _ => unreachable!(),
                        }
                        .map_err(|e| e.at_step(&step_id))?;
                        if can_cache {
                            if let Some(cache) = ctx.cache.as_deref_mut() {
                                cache.set(&step_id, value.clone());
                            }
                        }
                        value
                    }
                };

                outputs_from_return(core.op_meta(), &step_id, return_value)
            }
        }
    }

    /// Decode a step from its workflow-JSON form. `index` is the position in
    /// the `steps` array, used in messages.
    pub fn from_json(
        step_json: &serde_json::Value,
        index: usize,
        registry: &OpRegistry,
    ) -> Result<Step> {
        let entries = step_json.as_object().ok_or_else(|| {
            WorkflowError::InvalidEncoding(format!("step #{index} is not an object"))
        })?;
        let id = entries
            .get("id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                WorkflowError::InvalidEncoding(format!(
                    "step #{index} is missing the mandatory \"id\" property"
                ))
            })?;

        let mut step = if let Some(op_name) = entries.get("op") {
            let op_name = expect_text(op_name, index, "op")?;
            Step::op(op_name, Some(id), registry)?
        } else if let Some(resource) = entries.get("workflow") {
            let resource = expect_text(resource, index, "workflow")?;
            let workflow = Workflow::load(Path::new(resource), registry)?;
            Step::workflow(workflow, resource, Some(id))
        } else if let Some(expression) = entries.get("expression") {
            let expression = expect_text(expression, index, "expression")?;
            Step::expression(expression, Some(id))
        } else if let Some(command) = entries.get("command") {
            let command = expect_text(command, index, "command")?;
            let mut spec = SubProcessStep::new(command);
            if let Some(run_python) = entries.get("run_python").and_then(serde_json::Value::as_bool)
            {
                spec = spec.run_python(run_python);
            }
            if let Some(cwd) = entries.get("cwd").and_then(serde_json::Value::as_str) {
                spec = spec.cwd(cwd);
            }
            if let Some(env) = entries.get("env").and_then(serde_json::Value::as_object) {
                for (name, value) in env {
                    let value = value.as_str().ok_or_else(|| {
                        WorkflowError::InvalidEncoding(format!(
                            "step #{index}: \"env\" entry '{name}' is not a text"
                        ))
                    })?;
                    spec = spec.env(name, value);
                }
            }
            if let Some(shell) = entries.get("shell").and_then(serde_json::Value::as_bool) {
                spec = spec.shell(shell);
            }
            if let Some(pattern) = entries.get("started_re").and_then(serde_json::Value::as_str) {
                spec = spec.started_re(pattern);
            }
            if let Some(pattern) = entries.get("progress_re").and_then(serde_json::Value::as_str) {
                spec = spec.progress_re(pattern);
            }
            if let Some(pattern) = entries.get("done_re").and_then(serde_json::Value::as_str) {
                spec = spec.done_re(pattern);
            }
            Step::subprocess(spec, Some(id))
        } else if entries.contains_key("no_op") {
            Step::noop(Some(id))
        } else {
            return Err(WorkflowError::UnknownStepKind { index });
        };

        step.persistent = entries
            .get("persistent")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        if let Some(inputs) = entries.get("inputs").and_then(serde_json::Value::as_object) {
            for (name, port_json) in inputs {
                step.decode_port(PortSpace::Input, name, port_json)?;
            }
        }
        if let Some(outputs) = entries.get("outputs").and_then(serde_json::Value::as_object) {
            for (name, port_json) in outputs {
                step.decode_port(PortSpace::Output, name, port_json)?;
            }
        }

        Ok(step)
    }

    fn decode_port(
        &mut self,
        space: PortSpace,
        name: &str,
        port_json: &serde_json::Value,
    ) -> Result<()> {
        let owner = self.core.id().to_string();
        let port = match space {
            PortSpace::Input => self.core.ensure_input(name),
            PortSpace::Output => self.core.ensure_output(name),
        };
        let props = port.from_json(&owner, Some(port_json))?;
        if let Some(props) = props {
            let declared = match space {
                PortSpace::Input => self.core.op_meta_mut().inputs_mut(),
                PortSpace::Output => self.core.op_meta_mut().outputs_mut(),
            };
            declared.entry(name.to_string()).or_default().merge(props);
        }
        Ok(())
    }

    /// Encode the step into its workflow-JSON form.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let mut entries = serde_json::Map::new();
        entries.insert("id".to_string(), serde_json::json!(self.id()));
        if self.persistent {
            entries.insert("persistent".to_string(), serde_json::json!(true));
        }

        match &self.kind {
            StepKind::Op(step) => {
                entries.insert(
                    "op".to_string(),
                    serde_json::json!(step.op().qualified_name()),
                );
            }
            StepKind::Workflow(step) => {
                entries.insert("workflow".to_string(), serde_json::json!(step.resource()));
            }
            StepKind::Expression(step) => {
                entries.insert(
                    "expression".to_string(),
                    serde_json::json!(step.expression()),
                );
            }
            StepKind::SubProcess(step) => {
                entries.insert("command".to_string(), serde_json::json!(step.command()));
                if step.is_run_python() {
                    entries.insert("run_python".to_string(), serde_json::json!(true));
                }
                if let Some(cwd) = step.cwd_value() {
                    entries.insert("cwd".to_string(), serde_json::json!(cwd));
                }
                if !step.env_values().is_empty() {
                    entries.insert(
                        "env".to_string(),
                        serde_json::to_value(step.env_values())?,
                    );
                }
                if step.is_shell() {
                    entries.insert("shell".to_string(), serde_json::json!(true));
                }
                if let Some(pattern) = step.started_re_value() {
                    entries.insert("started_re".to_string(), serde_json::json!(pattern));
                }
                if let Some(pattern) = step.progress_re_value() {
                    entries.insert("progress_re".to_string(), serde_json::json!(pattern));
                }
                if let Some(pattern) = step.done_re_value() {
                    entries.insert("done_re".to_string(), serde_json::json!(pattern));
                }
            }
            StepKind::NoOp(_) => {
                entries.insert("no_op".to_string(), serde_json::json!(true));
            }
        }

        let inputs = self.inputs_to_json()?;
        if !inputs.is_empty() {
            entries.insert("inputs".to_string(), serde_json::Value::Object(inputs));
        }
        if !matches!(self.kind, StepKind::Op(_)) {
            let outputs = self.outputs_to_json()?;
            if !outputs.is_empty() {
                entries.insert("outputs".to_string(), serde_json::Value::Object(outputs));
            }
        }

        Ok(serde_json::Value::Object(entries))
    }

    fn inputs_to_json(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut encoded = serde_json::Map::new();
        let is_op = matches!(self.kind, StepKind::Op(_));

        for (name, port) in self.core.inputs() {
            let props = self.core.op_meta().inputs().get(name);

            if is_op {
                // Operation steps carry their metadata in the registry; only
                // non-default bindings are serialized.
                let port_json = port.to_json(false, false)?;
                if port_json == serde_json::json!({}) {
                    continue;
                }
                if port.is_value() {
                    if let Some(default) = props.and_then(|p| p.default_value.as_ref()) {
                        if Value::from_json(default) == *port.value() {
                            continue;
                        }
                    }
                }
                encoded.insert(name.clone(), port_json);
                continue;
            }

            encoded.insert(name.clone(), merge_port_json(port, false, props)?);
        }
        Ok(encoded)
    }

    fn outputs_to_json(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut encoded = serde_json::Map::new();
        for (name, port) in self.core.outputs() {
            let props = self.core.op_meta().outputs().get(name);
            encoded.insert(name.clone(), merge_port_json(port, true, props)?);
        }
        Ok(encoded)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.kind {
            StepKind::Op(step) => step.op().qualified_name().to_string(),
            StepKind::Expression(step) => format!("\"{}\"", step.expression()),
            StepKind::SubProcess(step) => format!("\"{}\"", step.command()),
            StepKind::Workflow(step) => step.resource().to_string(),
            StepKind::NoOp(_) => "noop".to_string(),
        };

        let inputs: Vec<String> = self
            .core
            .inputs()
            .iter()
            .map(|(name, port)| match (port.source(), port.is_value()) {
                (Some(loc), _) => format!("{name}=@{loc}"),
                (None, true) => format!("{name}={}", port.value().to_text()),
                (None, false) => name.clone(),
            })
            .collect();

        write!(
            f,
            "{} = {body}({}) [{}]",
            self.id(),
            inputs.join(", "),
            self.kind.label()
        )
    }
}

fn synthesized_meta(
    id: &str,
    inputs: IndexMap<String, PortProps>,
    outputs: IndexMap<String, PortProps>,
) -> OpMetaInfo {
    let mut meta = OpMetaInfo::new(id);
    for (name, props) in inputs {
        meta = meta.with_input(&name, props);
    }
    for (name, props) in outputs {
        meta = meta.with_output(&name, props);
    }
    meta.ensure_return_output();
    meta
}

fn outputs_from_return(
    meta: &OpMetaInfo,
    step_id: &str,
    return_value: Value,
) -> Result<IndexMap<String, Value>> {
    if meta.has_named_outputs() {
        match return_value {
            Value::Object(entries) => Ok(entries),
            other => Err(WorkflowError::OperationFailed {
                step_id: step_id.to_string(),
                source: anyhow::anyhow!(
                    "step declares named outputs but produced a {} value",
                    other.type_label()
                ),
            }),
        }
    } else {
        let mut outputs = IndexMap::new();
        outputs.insert(RETURN_OUTPUT_NAME.to_string(), return_value);
        Ok(outputs)
    }
}

fn merge_port_json(
    port: &crate::node::NodePort,
    is_output: bool,
    props: Option<&PortProps>,
) -> Result<serde_json::Value> {
    let binding = port.to_json(is_output, false)?;
    let props_json = match props {
        Some(props) if !props.is_empty() => serde_json::to_value(props)?,
        _ => serde_json::json!({}),
    };
    let props_entries = match props_json {
        serde_json::Value::Object(entries) => entries,
        _ => serde_json::Map::new(),
    };

    if props_entries.is_empty() {
        return Ok(binding);
    }

    // Metadata forces the object form; the compact text form cannot carry it.
    let mut entries = match binding {
        serde_json::Value::String(text) => {
            let mut entries = serde_json::Map::new();
            entries.insert("source".to_string(), serde_json::json!(text));
            entries
        }
        serde_json::Value::Object(entries) => entries,
        other => {
            return Err(WorkflowError::InvalidEncoding(format!(
                "unexpected port encoding: {other}"
            )))
        }
    };
    entries.extend(props_entries);
    Ok(serde_json::Value::Object(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PortProps;
    use crate::node::SourceRef;
    use crate::registry::Operation;
    use crate::types::DataType;

    fn registry_with_double() -> OpRegistry {
        let mut registry = OpRegistry::new();
        let meta = OpMetaInfo::new("test.double")
            .with_input(
                "x",
                PortProps {
                    data_type: Some(DataType::Int),
                    default_value: Some(serde_json::json!(1)),
                    ..Default::default()
                },
            )
            .with_return_output();
        registry
            .add_op(
                Operation::new(meta, |inputs, _monitor| {
                    Ok(Value::Int(2 * inputs["x"].as_i64().unwrap_or(0)))
                }),
                true,
            )
            .expect("double registers");
        registry
    }

    #[test]
    fn test_op_step_from_json_requires_known_op() {
        let registry = registry_with_double();

        let step = Step::from_json(
            &serde_json::json!({"id": "s1", "op": "test.double"}),
            0,
            &registry,
        )
        .expect("op step should decode");
        assert_eq!(step.id(), "s1");
        assert_eq!(step.kind().label(), "OpStep");

        let err = Step::from_json(
            &serde_json::json!({"id": "s1", "op": "test.unknown"}),
            0,
            &registry,
        )
        .expect_err("unknown op should fail");
        assert!(matches!(err, WorkflowError::UnknownOperation(_)));
    }

    #[test]
    fn test_unknown_step_kind_and_missing_id() {
        let registry = OpRegistry::new();

        let err = Step::from_json(&serde_json::json!({"id": "s1"}), 3, &registry)
            .expect_err("missing discriminator should fail");
        assert!(matches!(err, WorkflowError::UnknownStepKind { index: 3 }));

        let err = Step::from_json(&serde_json::json!({"no_op": true}), 0, &registry)
            .expect_err("missing id should fail");
        assert!(matches!(err, WorkflowError::InvalidEncoding(_)));
    }

    #[test]
    fn test_op_step_serialization_omits_default_inputs() {
        let registry = registry_with_double();
        let mut step = Step::op("test.double", Some("s1"), &registry).expect("op step");

        step.core_mut()
            .input_mut("x")
            .expect("port x")
            .set_value(Value::Int(1));
        let json = step.to_json().expect("encode");
        assert_eq!(json, serde_json::json!({"id": "s1", "op": "test.double"}));

        step.core_mut()
            .input_mut("x")
            .expect("port x")
            .set_value(Value::Int(5));
        let json = step.to_json().expect("encode");
        assert_eq!(
            json,
            serde_json::json!({"id": "s1", "op": "test.double", "inputs": {"x": {"value": 5}}})
        );
    }

    #[test]
    fn test_expression_step_round_trip_keeps_ports_and_metadata() {
        let registry = OpRegistry::new();
        let json = serde_json::json!({
            "id": "e1",
            "expression": "a + b*2",
            "inputs": {
                "a": ".x",
                "b": {"value": 5, "data_type": "int"},
            },
        });

        let step = Step::from_json(&json, 0, &registry).expect("expression step should decode");
        assert_eq!(step.kind().label(), "ExpressionStep");
        assert_eq!(
            step.core().input("a").expect("port a").source_ref(),
            Some(&SourceRef::parse(".x").expect("ref"))
        );
        assert_eq!(
            step.op_meta().inputs().get("b").expect("props b").data_type,
            Some(DataType::Int)
        );

        let encoded = step.to_json().expect("encode");
        assert_eq!(
            encoded,
            serde_json::json!({
                "id": "e1",
                "expression": "a + b*2",
                "inputs": {
                    "a": ".x",
                    "b": {"value": 5, "data_type": "int"},
                },
                "outputs": {"return": {}},
            })
        );
    }

    #[test]
    fn test_subprocess_step_round_trip() {
        let registry = OpRegistry::new();
        let json = serde_json::json!({
            "id": "p1",
            "persistent": true,
            "command": "resample {rate}",
            "shell": true,
            "env": {"LC_ALL": "C"},
            "started_re": "^started",
            "inputs": {"rate": {"value": 0.5}},
        });

        let step = Step::from_json(&json, 0, &registry).expect("sub-process step should decode");
        assert!(step.persistent());
        assert_eq!(step.kind().label(), "SubProcessStep");

        let encoded = step.to_json().expect("encode");
        assert_eq!(
            encoded,
            serde_json::json!({
                "id": "p1",
                "persistent": true,
                "command": "resample {rate}",
                "env": {"LC_ALL": "C"},
                "shell": true,
                "started_re": "^started",
                "inputs": {"rate": {"value": 0.5}},
                "outputs": {"return": {}},
            })
        );
    }

    #[test]
    fn test_noop_step_routes_ports_in_json() {
        let registry = OpRegistry::new();
        let json = serde_json::json!({
            "id": "n1",
            "no_op": true,
            "inputs": {"fan_in": "other.out"},
            "outputs": {"fan_out": {"source": ".fan_in"}},
        });

        let step = Step::from_json(&json, 0, &registry).expect("no-op step should decode");
        assert_eq!(step.kind().label(), "NoOpStep");
        assert_eq!(
            step.core()
                .output("fan_out")
                .expect("port fan_out")
                .source_ref()
                .expect("ref")
                .to_string(),
            ".fan_in"
        );

        // Never resolved, so the symbolic reference text round-trips as-is.
        let encoded = step.to_json().expect("encode");
        assert_eq!(
            encoded,
            serde_json::json!({
                "id": "n1",
                "no_op": true,
                "inputs": {"fan_in": "other.out"},
                "outputs": {"fan_out": ".fan_in", "return": {}},
            })
        );
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = Step::noop(None);
        let b = Step::noop(None);
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("noopstep_"));
    }

    #[test]
    fn test_display_form() {
        let registry = registry_with_double();
        let mut step = Step::op("test.double", Some("s1"), &registry).expect("op step");
        step.core_mut()
            .input_mut("x")
            .expect("port x")
            .set_value(Value::Int(5));

        assert_eq!(step.to_string(), "s1 = test.double(x=5) [OpStep]");
    }
}
