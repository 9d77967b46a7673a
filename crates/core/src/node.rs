use std::fmt;

use indexmap::IndexMap;

use crate::descriptor::{OpMetaInfo, PortProps};
use crate::error::{Result, WorkflowError};
use crate::types::Value;

/// Which namespace of a node a port lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpace {
    Input,
    Output,
}

/// Symbolic reference to another port, parsed from the textual forms
/// `"NODE.PORT"`, `"NODE"`, and `".PORT"`. Unresolved until matched against
/// an actual port by `Workflow::update_sources`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub node_id: Option<String>,
    pub port_name: Option<String>,
}

impl SourceRef {
    pub fn parse(text: &str) -> Result<SourceRef> {
        let invalid = || {
            WorkflowError::InvalidEncoding(format!(
                "source reference '{text}' is neither \"<node-id>.<name>\", \"<node-id>\", nor \".<name>\""
            ))
        };

        match text.rsplit_once('.') {
            None => {
                if text.is_empty() {
                    return Err(invalid());
                }
                Ok(SourceRef {
                    node_id: Some(text.to_string()),
                    port_name: None,
                })
            }
            Some((node_id, port_name)) => {
                if port_name.is_empty() {
                    return Err(invalid());
                }
                Ok(SourceRef {
                    node_id: (!node_id.is_empty()).then(|| node_id.to_string()),
                    port_name: Some(port_name.to_string()),
                })
            }
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.node_id, &self.port_name) {
            (Some(node_id), Some(port_name)) => write!(f, "{node_id}.{port_name}"),
            (Some(node_id), None) => f.write_str(node_id),
            (None, Some(port_name)) => write!(f, ".{port_name}"),
            (None, None) => Ok(()),
        }
    }
}

/// Resolved location of a port within a workflow tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLoc {
    pub node_id: String,
    pub port_name: String,
    pub space: PortSpace,
}

impl PortLoc {
    pub fn new(node_id: &str, port_name: &str, space: PortSpace) -> Self {
        Self {
            node_id: node_id.to_string(),
            port_name: port_name.to_string(),
            space,
        }
    }
}

impl fmt::Display for PortLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Always the dotted form; the bare node-id shorthand is accepted on
        // parse but never emitted.
        write!(f, "{}.{}", self.node_id, self.port_name)
    }
}

/// A named input or output slot of a node.
///
/// A port is in exactly one of three states: undefined, literal value, or
/// bound to a source port. Assigning a value clears any source; assigning a
/// source clears any value. A symbolic source reference may additionally be
/// pending until resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePort {
    name: String,
    source_ref: Option<SourceRef>,
    source: Option<PortLoc>,
    value: Value,
}

impl NodePort {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The locally stored literal. Ports bound to a source are read through
    /// `Workflow::port_value`, which chases the source chain.
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_value(&self) -> bool {
        self.source.is_none() && !self.value.is_undefined()
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = value;
        self.source = None;
        self.source_ref = None;
    }

    pub fn source(&self) -> Option<&PortLoc> {
        self.source.as_ref()
    }

    pub fn source_ref(&self) -> Option<&SourceRef> {
        self.source_ref.as_ref()
    }

    /// Record a symbolic reference to be resolved later.
    pub fn set_source_ref(&mut self, source_ref: SourceRef) {
        self.source_ref = Some(source_ref);
        self.source = None;
        self.value = Value::Undefined;
    }

    /// Bind to a concrete port, keeping the symbolic reference in sync.
    pub fn set_resolved_source(&mut self, loc: PortLoc) {
        self.source_ref = Some(SourceRef {
            node_id: Some(loc.node_id.clone()),
            port_name: Some(loc.port_name.clone()),
        });
        self.source = Some(loc);
        self.value = Value::Undefined;
    }

    /// Reset to the undefined state.
    pub fn clear(&mut self) {
        self.source_ref = None;
        self.source = None;
        self.value = Value::Undefined;
    }

    /// Populate from the port-JSON forms of the workflow format. Returns the
    /// metadata carried alongside the binding, if any, for the caller to
    /// merge into the node's meta-information. `owner` is used in messages.
    pub fn from_json(
        &mut self,
        owner: &str,
        port_json: Option<&serde_json::Value>,
    ) -> Result<Option<PortProps>> {
        self.clear();

        let Some(port_json) = port_json else {
            return Ok(None);
        };

        match port_json {
            serde_json::Value::String(text) => {
                self.set_source_ref(SourceRef::parse(text)?);
                Ok(None)
            }
            serde_json::Value::Object(entries) => {
                if entries.contains_key("source") && entries.contains_key("value") {
                    return Err(WorkflowError::InvalidEncoding(format!(
                        "error decoding '{owner}.{}' because \"source\" and \"value\" are mutually exclusive",
                        self.name
                    )));
                }

                if let Some(source) = entries.get("source") {
                    let text = source.as_str().ok_or_else(|| {
                        WorkflowError::InvalidEncoding(format!(
                            "error decoding '{owner}.{}' because \"source\" is not a text",
                            self.name
                        ))
                    })?;
                    self.set_source_ref(SourceRef::parse(text)?);
                } else if let Some(value) = entries.get("value") {
                    self.set_value(Value::from_json(value));
                }

                let metadata: serde_json::Map<String, serde_json::Value> = entries
                    .iter()
                    .filter(|(key, _)| key.as_str() != "source" && key.as_str() != "value")
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                if metadata.is_empty() {
                    return Ok(None);
                }
                let props: PortProps =
                    serde_json::from_value(serde_json::Value::Object(metadata))?;
                Ok(Some(props))
            }
            _ => Err(WorkflowError::InvalidEncoding(format!(
                "error decoding '{owner}.{}' because the port encoding is neither a text nor an object",
                self.name
            ))),
        }
    }

    /// Emit the port-JSON form. Output literals are never serialized (they
    /// are recomputed); sources serialize as compact text unless `force_dict`.
    pub fn to_json(&self, is_output: bool, force_dict: bool) -> Result<serde_json::Value> {
        let source_text = match (&self.source, &self.source_ref) {
            (Some(loc), _) => Some(loc.to_string()),
            (None, Some(source_ref)) => Some(source_ref.to_string()),
            (None, None) => None,
        };

        if let Some(text) = source_text {
            return Ok(if force_dict {
                serde_json::json!({ "source": text })
            } else {
                serde_json::Value::String(text)
            });
        }

        if !self.value.is_undefined() && !is_output {
            return Ok(serde_json::json!({ "value": self.value.to_json()? }));
        }

        Ok(serde_json::json!({}))
    }
}

/// Shared shape of every node in a workflow tree: an identifier, operation
/// meta-information, and the two ordered port namespaces derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCore {
    id: String,
    op_meta: OpMetaInfo,
    inputs: IndexMap<String, NodePort>,
    outputs: IndexMap<String, NodePort>,
}

impl NodeCore {
    pub fn new(id: &str, op_meta: OpMetaInfo) -> Self {
        let inputs = op_meta
            .inputs()
            .keys()
            .map(|name| (name.clone(), NodePort::new(name)))
            .collect();
        let outputs = op_meta
            .outputs()
            .keys()
            .map(|name| (name.clone(), NodePort::new(name)))
            .collect();
        Self {
            id: id.to_string(),
            op_meta,
            inputs,
            outputs,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn set_id(&mut self, id: &str) {
        self.id = id.to_string();
    }

    pub fn op_meta(&self) -> &OpMetaInfo {
        &self.op_meta
    }

    pub fn op_meta_mut(&mut self) -> &mut OpMetaInfo {
        &mut self.op_meta
    }

    pub fn inputs(&self) -> &IndexMap<String, NodePort> {
        &self.inputs
    }

    pub fn outputs(&self) -> &IndexMap<String, NodePort> {
        &self.outputs
    }

    pub fn input(&self, name: &str) -> Option<&NodePort> {
        self.inputs.get(name)
    }

    pub fn input_mut(&mut self, name: &str) -> Option<&mut NodePort> {
        self.inputs.get_mut(name)
    }

    pub fn output(&self, name: &str) -> Option<&NodePort> {
        self.outputs.get(name)
    }

    pub fn output_mut(&mut self, name: &str) -> Option<&mut NodePort> {
        self.outputs.get_mut(name)
    }

    pub fn port(&self, space: PortSpace, name: &str) -> Option<&NodePort> {
        match space {
            PortSpace::Input => self.input(name),
            PortSpace::Output => self.output(name),
        }
    }

    /// Find a port by name, searching `preferred` first, then the other
    /// namespace. Steps search outputs first (dependents usually read step
    /// outputs); workflows search inputs first.
    pub fn find_port(&self, name: &str, preferred: PortSpace) -> Option<(PortSpace, &NodePort)> {
        let (first, second) = match preferred {
            PortSpace::Output => (PortSpace::Output, PortSpace::Input),
            PortSpace::Input => (PortSpace::Input, PortSpace::Output),
        };
        if let Some(port) = self.port(first, name) {
            return Some((first, port));
        }
        self.port(second, name).map(|port| (second, port))
    }

    /// Create the named input port (and its meta entry) if missing.
    pub fn ensure_input(&mut self, name: &str) -> &mut NodePort {
        if !self.op_meta.inputs().contains_key(name) {
            self.op_meta
                .inputs_mut()
                .insert(name.to_string(), PortProps::default());
        }
        self.inputs
            .entry(name.to_string())
            .or_insert_with(|| NodePort::new(name))
    }

    /// Create the named output port (and its meta entry) if missing.
    pub fn ensure_output(&mut self, name: &str) -> &mut NodePort {
        if !self.op_meta.outputs().contains_key(name) {
            self.op_meta
                .outputs_mut()
                .insert(name.to_string(), PortProps::default());
        }
        self.outputs
            .entry(name.to_string())
            .or_insert_with(|| NodePort::new(name))
    }

    /// All ports, outputs first, for cascading rewrites.
    pub fn ports_mut(&mut self) -> impl Iterator<Item = (PortSpace, &mut NodePort)> {
        self.outputs
            .values_mut()
            .map(|port| (PortSpace::Output, port))
            .chain(
                self.inputs
                    .values_mut()
                    .map(|port| (PortSpace::Input, port)),
            )
    }

    pub fn ports(&self) -> impl Iterator<Item = (PortSpace, &NodePort)> {
        self.outputs
            .values()
            .map(|port| (PortSpace::Output, port))
            .chain(self.inputs.values().map(|port| (PortSpace::Input, port)))
    }

    /// Rewrite every symbolic reference and resolved locator that names
    /// `old_id` to name `new_id`.
    pub fn rewrite_source_node_id(&mut self, old_id: &str, new_id: &str) {
        for (_, port) in self.ports_mut() {
            if let Some(source_ref) = &mut port.source_ref {
                if source_ref.node_id.as_deref() == Some(old_id) {
                    source_ref.node_id = Some(new_id.to_string());
                }
            }
            if let Some(source) = &mut port.source {
                if source.node_id == old_id {
                    source.node_id = new_id.to_string();
                }
            }
        }
    }

    /// Clear every port whose *resolved* source names `node_id`. Symbolic
    /// references that were never resolved survive so a later resolution can
    /// rebind them.
    pub fn clear_ports_resolved_to(&mut self, node_id: &str) {
        for (_, port) in self.ports_mut() {
            if port
                .source
                .as_ref()
                .map(|loc| loc.node_id == node_id)
                .unwrap_or(false)
            {
                port.clear();
            }
        }
    }

    pub fn display_port(&self, name: &str) -> String {
        format!("{}.{name}", self.id)
    }
}
