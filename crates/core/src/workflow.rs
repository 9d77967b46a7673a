use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tracing::{debug, warn};

use crate::context::{apply_context_inputs, ExecutionContext};
use crate::descriptor::{OpMetaInfo, PortProps, MONITOR_INPUT_NAME, RETURN_OUTPUT_NAME};
use crate::error::{Result, WorkflowError};
use crate::monitor::ChildMonitor;
use crate::node::{NodeCore, NodePort, PortLoc, PortSpace, SourceRef};
use crate::registry::OpRegistry;
use crate::steps::Step;
use crate::types::Value;

/// Version number of the workflow JSON schema.
pub const WORKFLOW_SCHEMA_VERSION: i64 = 1;

pub const WORKFLOW_SCHEMA_VERSION_TAG: &str = "schema_version";

/// Identifies the node owning a port during tree-wide passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortOwner {
    Root,
    Step(usize),
}

/// A workflow of connected steps.
///
/// The workflow is a composite node: it owns its steps in insertion order,
/// resolves symbolic source references across them, orders them by data
/// dependency, and round-trips through the workflow JSON format. Operations
/// that the port/step model expresses as "cascades through the root" (rename,
/// orphan cleanup, resolution) are methods here, walking the owned tree.
#[derive(Debug, Clone)]
pub struct Workflow {
    core: NodeCore,
    steps: Vec<Step>,
    step_ids: HashMap<String, usize>,
}

impl Workflow {
    /// New empty workflow; the node id is the meta-information's qualified
    /// name.
    pub fn new(op_meta: OpMetaInfo) -> Self {
        let id = op_meta.qualified_name().to_string();
        Self {
            core: NodeCore::new(&id, op_meta),
            steps: Vec::new(),
            step_ids: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.core.id()
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

    /// The steps in the order they were added.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.step_ids
            .get(step_id)
            .copied()
            .map(|index| &self.steps[index])
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        let index = self.step_ids.get(step_id).copied()?;
        Some(&mut self.steps[index])
    }

    /// Find a direct child step. Nested workflows are separate trees and are
    /// not searched.
    pub fn find_node(&self, node_id: &str) -> Option<&Step> {
        self.step(node_id)
    }

    pub fn input_mut(&mut self, name: &str) -> Option<&mut NodePort> {
        self.core.input_mut(name)
    }

    pub fn output_mut(&mut self, name: &str) -> Option<&mut NodePort> {
        self.core.output_mut(name)
    }

    pub fn output_names(&self) -> Vec<String> {
        self.core.outputs().keys().cloned().collect()
    }

    // ─── Mutation ───────────────────────────────────────────────────────────

    /// Add a step. An existing step with the same id is replaced only when
    /// `can_exist` is set; the replaced step is returned. After a
    /// replacement, ports bound to the replaced step are re-resolved against
    /// the new tree and cleared when they no longer bind; symbolic references
    /// that were never resolved are left for a later `update_sources`.
    pub fn add_step(&mut self, step: Step, can_exist: bool) -> Result<Option<Step>> {
        let step_id = step.id().to_string();
        match self.step_ids.get(&step_id).copied() {
            Some(index) => {
                if !can_exist {
                    return Err(WorkflowError::DuplicateStepId(step_id));
                }
                let old = std::mem::replace(&mut self.steps[index], step);
                self.rebind_ports_referencing(&step_id);
                Ok(Some(old))
            }
            None => {
                self.step_ids.insert(step_id, self.steps.len());
                self.steps.push(step);
                Ok(None)
            }
        }
    }

    pub fn add_steps<I: IntoIterator<Item = Step>>(&mut self, steps: I) -> Result<()> {
        for step in steps {
            self.add_step(step, false)?;
        }
        Ok(())
    }

    /// Remove a step; every port still bound to it is cleared to the
    /// undefined state.
    pub fn remove_step(&mut self, step_id: &str, must_exist: bool) -> Result<Option<Step>> {
        let Some(index) = self.step_ids.get(step_id).copied() else {
            if must_exist {
                return Err(WorkflowError::UnknownStep(step_id.to_string()));
            }
            return Ok(None);
        };
        let old = self.steps.remove(index);
        self.rebuild_step_index();
        self.core.clear_ports_resolved_to(step_id);
        for step in &mut self.steps {
            step.core_mut().clear_ports_resolved_to(step_id);
        }
        Ok(Some(old))
    }

    /// Rename the workflow itself or one of its steps, rewriting every
    /// symbolic reference and resolved locator in the tree. Renaming onto an
    /// id already taken by a sibling is rejected: step ids are unique among
    /// the direct children of a workflow.
    pub fn rename_node(&mut self, old_id: &str, new_id: &str) -> Result<()> {
        if new_id.is_empty() {
            return Err(WorkflowError::InvalidEncoding(
                "node id must not be empty".to_string(),
            ));
        }
        if old_id == new_id {
            return Ok(());
        }
        if new_id == self.core.id() || self.step_ids.contains_key(new_id) {
            return Err(WorkflowError::DuplicateStepId(new_id.to_string()));
        }

        if old_id == self.core.id() {
            self.core.set_id(new_id);
        } else {
            let index = self
                .step_ids
                .remove(old_id)
                .ok_or_else(|| WorkflowError::UnknownStep(old_id.to_string()))?;
            self.steps[index].core_mut().set_id(new_id);
            self.step_ids.insert(new_id.to_string(), index);
        }

        self.core.rewrite_source_node_id(old_id, new_id);
        for step in &mut self.steps {
            step.core_mut().rewrite_source_node_id(old_id, new_id);
        }
        Ok(())
    }

    fn rebuild_step_index(&mut self) {
        self.step_ids = self
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| (step.id().to_string(), index))
            .collect();
    }

    // ─── Source resolution ──────────────────────────────────────────────────

    /// Resolve every pending symbolic source reference in the tree. Must be
    /// called after any batch of mutations; resolution failures are errors,
    /// never silent.
    pub fn update_sources(&mut self) -> Result<()> {
        let mut resolutions: Vec<(PortOwner, PortSpace, String, PortLoc)> = Vec::new();

        for (space, port) in self.core.ports() {
            if let Some(source_ref) = port.source_ref() {
                let loc =
                    self.resolve_source_ref(PortOwner::Root, space, port.name(), source_ref)?;
                resolutions.push((PortOwner::Root, space, port.name().to_string(), loc));
            }
        }
        for (index, step) in self.steps.iter().enumerate() {
            for (space, port) in step.core().ports() {
                if let Some(source_ref) = port.source_ref() {
                    let loc = self.resolve_source_ref(
                        PortOwner::Step(index),
                        space,
                        port.name(),
                        source_ref,
                    )?;
                    resolutions.push((PortOwner::Step(index), space, port.name().to_string(), loc));
                }
            }
        }

        for (owner, space, name, loc) in resolutions {
            self.owner_port_mut(owner, space, &name).set_resolved_source(loc);
        }
        Ok(())
    }

    fn owner_core(&self, owner: PortOwner) -> &NodeCore {
        match owner {
            PortOwner::Root => &self.core,
            PortOwner::Step(index) => self.steps[index].core(),
        }
    }

    fn owner_port_mut(&mut self, owner: PortOwner, space: PortSpace, name: &str) -> &mut NodePort {
        let core = match owner {
            PortOwner::Root => &mut self.core,
            PortOwner::Step(index) => self.steps[index].core_mut(),
        };
        match space {
            PortSpace::Input => core.input_mut(name).expect("resolved port exists"),
            PortSpace::Output => core.output_mut(name).expect("resolved port exists"),
        }
    }

    fn lookup_node(&self, node_id: &str) -> Option<(&NodeCore, PortSpace)> {
        // Port names resolve inputs-first on workflows (dependents usually
        // wire workflow inputs down) and outputs-first on steps (dependents
        // usually read step outputs).
        if node_id == self.core.id() {
            return Some((&self.core, PortSpace::Input));
        }
        self.step(node_id)
            .map(|step| (step.core(), PortSpace::Output))
    }

    fn resolve_source_ref(
        &self,
        owner: PortOwner,
        port_space: PortSpace,
        port_name: &str,
        source_ref: &SourceRef,
    ) -> Result<PortLoc> {
        let owner_core = self.owner_core(owner);
        let port_display = owner_core.display_port(port_name);

        let loc = match (&source_ref.node_id, &source_ref.port_name) {
            (Some(node_id), Some(name)) => {
                let (core, preferred) = self.lookup_node(node_id).ok_or_else(|| {
                    WorkflowError::UnknownNode {
                        port: port_display.clone(),
                        node_id: node_id.clone(),
                    }
                })?;
                let (space, _) =
                    core.find_port(name, preferred)
                        .ok_or_else(|| WorkflowError::UnknownPort {
                            port: port_display.clone(),
                            node_id: node_id.clone(),
                            name: name.clone(),
                        })?;
                PortLoc::new(node_id, name, space)
            }
            (Some(node_id), None) => {
                let (core, _) = self.lookup_node(node_id).ok_or_else(|| {
                    WorkflowError::UnknownNode {
                        port: port_display.clone(),
                        node_id: node_id.clone(),
                    }
                })?;
                if core.outputs().len() != 1 {
                    return Err(WorkflowError::AmbiguousNode {
                        port: port_display,
                        node_id: node_id.clone(),
                        output_count: core.outputs().len(),
                    });
                }
                let name = core.outputs().keys().next().expect("single output");
                PortLoc::new(node_id, name, PortSpace::Output)
            }
            (None, Some(name)) => {
                // Dotted form: search the owning node, then its parents.
                let mut found = None;
                if let PortOwner::Step(_) = owner {
                    if let Some((space, _)) = owner_core.find_port(name, PortSpace::Output) {
                        found = Some(PortLoc::new(owner_core.id(), name, space));
                    }
                }
                if found.is_none() {
                    if let Some((space, _)) = self.core.find_port(name, PortSpace::Input) {
                        found = Some(PortLoc::new(self.core.id(), name, space));
                    }
                }
                found.ok_or(WorkflowError::UnknownPortInScope {
                    port: port_display.clone(),
                    name: name.clone(),
                })?
            }
            (None, None) => {
                return Err(WorkflowError::InvalidEncoding(format!(
                    "source reference of '{port_display}' is empty"
                )))
            }
        };

        if loc.node_id == owner_core.id() && loc.port_name == port_name && loc.space == port_space {
            return Err(WorkflowError::SelfBinding(port_display));
        }
        Ok(loc)
    }

    /// Re-resolve every port whose resolved source names `node_id`, clearing
    /// the ones that no longer bind.
    fn rebind_ports_referencing(&mut self, node_id: &str) {
        let mut targets: Vec<(PortOwner, PortSpace, String, SourceRef)> = Vec::new();

        for (space, port) in self.core.ports() {
            if let (Some(loc), Some(source_ref)) = (port.source(), port.source_ref()) {
                if loc.node_id == node_id {
                    targets.push((
                        PortOwner::Root,
                        space,
                        port.name().to_string(),
                        source_ref.clone(),
                    ));
                }
            }
        }
        for (index, step) in self.steps.iter().enumerate() {
            for (space, port) in step.core().ports() {
                if let (Some(loc), Some(source_ref)) = (port.source(), port.source_ref()) {
                    if loc.node_id == node_id {
                        targets.push((
                            PortOwner::Step(index),
                            space,
                            port.name().to_string(),
                            source_ref.clone(),
                        ));
                    }
                }
            }
        }

        for (owner, space, name, source_ref) in targets {
            match self.resolve_source_ref(owner, space, &name, &source_ref) {
                Ok(loc) => self.owner_port_mut(owner, space, &name).set_resolved_source(loc),
                Err(_) => self.owner_port_mut(owner, space, &name).clear(),
            }
        }
    }

    // ─── Values ─────────────────────────────────────────────────────────────

    /// Read the value at a resolved port location, transitively following
    /// the source chain. `None` means the chain ends in an undefined port.
    pub fn port_value(&self, loc: &PortLoc) -> Option<Value> {
        let core = if loc.node_id == self.core.id() {
            &self.core
        } else {
            self.step(&loc.node_id)?.core()
        };
        let port = core.port(loc.space, &loc.port_name)?;
        self.chase_port(port)
    }

    fn chase_port(&self, port: &NodePort) -> Option<Value> {
        match port.source() {
            Some(loc) => self.port_value(loc),
            None => (!port.value().is_undefined()).then(|| port.value().clone()),
        }
    }

    pub fn input_value(&self, name: &str) -> Value {
        self.core
            .input(name)
            .and_then(|port| self.chase_port(port))
            .unwrap_or(Value::Null)
    }

    pub fn output_value(&self, name: &str) -> Value {
        self.core
            .output(name)
            .and_then(|port| self.chase_port(port))
            .unwrap_or(Value::Null)
    }

    /// The workflow's result: a map of every output for named outputs, the
    /// single `return` value otherwise.
    pub fn get_output_value(&self) -> Value {
        if self.core.op_meta().has_named_outputs() {
            let mut outputs = IndexMap::new();
            for name in self.core.outputs().keys() {
                outputs.insert(name.clone(), self.output_value(name));
            }
            Value::Object(outputs)
        } else {
            self.output_value(RETURN_OUTPUT_NAME)
        }
    }

    // ─── Dependencies & ordering ────────────────────────────────────────────

    /// Longest dependency path from `from_id` to `to_id` via input sources:
    /// 0 for the node itself, 1 for a direct source, -1 when `to_id` is not
    /// a source of `from_id`.
    pub fn max_distance(&self, from_id: &str, to_id: &str) -> i64 {
        if from_id == to_id {
            return 0;
        }
        let core = if from_id == self.core.id() {
            &self.core
        } else {
            match self.step(from_id) {
                Some(step) => step.core(),
                None => return -1,
            }
        };

        let mut max = -1;
        for port in core.inputs().values() {
            // A pending symbolic reference already names its dependency.
            if let Some(source_ref) = port.source_ref() {
                if source_ref.node_id.as_deref() == Some(to_id) {
                    max = max.max(1);
                }
            }
            if let Some(loc) = port.source() {
                if loc.node_id == to_id {
                    max = max.max(1);
                }
                let distance = self.max_distance(&loc.node_id, to_id);
                if distance > 0 {
                    max = max.max(distance + 1);
                }
            }
        }
        max
    }

    /// Whether the step depends on `other_id` for its computation.
    pub fn requires(&self, step_id: &str, other_id: &str) -> bool {
        self.max_distance(step_id, other_id) > 0
    }

    fn assert_acyclic(&self) -> Result<()> {
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..self.steps.len()).map(|i| graph.add_node(i)).collect();
        for (index, step) in self.steps.iter().enumerate() {
            for port in step.core().inputs().values() {
                // Pending symbolic references count as edges too, so the
                // check covers the same dependencies `max_distance` sees
                // when ordering an unresolved workflow.
                let source_id = match (port.source(), port.source_ref()) {
                    (Some(loc), _) => Some(loc.node_id.as_str()),
                    (None, Some(source_ref)) => source_ref.node_id.as_deref(),
                    (None, None) => None,
                };
                if let Some(source_id) = source_id {
                    if let Some(&source_index) = self.step_ids.get(source_id) {
                        if source_index != index {
                            graph.add_edge(nodes[source_index], nodes[index], ());
                        }
                    }
                }
            }
        }
        toposort(&graph, None)
            .map(|_| ())
            .map_err(|_| WorkflowError::CyclicGraph(self.core.id().to_string()))
    }

    /// Indices of the steps in an order in which they can be executed: by
    /// longest dependency distance, ascending, ties broken by insertion
    /// order.
    pub fn execution_order(&self) -> Result<Vec<usize>> {
        self.assert_acyclic()?;
        let n = self.steps.len();
        if n < 2 {
            return Ok((0..n).collect());
        }

        let mut keyed: Vec<(i64, usize)> = (0..n)
            .map(|i| {
                let mut max_dist = 0;
                for j in 0..n {
                    if i != j {
                        let distance = self.max_distance(self.steps[i].id(), self.steps[j].id());
                        if distance > 0 {
                            max_dist = max_dist.max(distance);
                        }
                    }
                }
                (max_dist, i)
            })
            .collect();
        keyed.sort_by_key(|(distance, _)| *distance);
        Ok(keyed.into_iter().map(|(_, index)| index).collect())
    }

    /// The steps in execution order.
    pub fn sorted_steps(&self) -> Result<Vec<&Step>> {
        Ok(self
            .execution_order()?
            .into_iter()
            .map(|index| &self.steps[index])
            .collect())
    }

    /// The minimal set of steps needed to compute the output of `step_id`,
    /// in execution order with that step last.
    pub fn find_steps_to_compute(&self, step_id: &str) -> Result<Vec<&Step>> {
        if !self.step_ids.contains_key(step_id) {
            return Err(WorkflowError::UnknownStep(step_id.to_string()));
        }
        self.assert_acyclic()?;

        let mut closure: Vec<String> = Vec::new();
        self.collect_predecessors(step_id, &mut closure);

        let order = self.execution_order()?;
        let position: HashMap<usize, usize> = order
            .iter()
            .enumerate()
            .map(|(position, &index)| (index, position))
            .collect();

        let mut subset: Vec<usize> = closure
            .iter()
            .filter_map(|id| self.step_ids.get(id).copied())
            .collect();
        subset.sort_by_key(|index| position[index]);
        Ok(subset.into_iter().map(|index| &self.steps[index]).collect())
    }

    fn collect_predecessors(&self, node_id: &str, acc: &mut Vec<String>) {
        if node_id == self.core.id() {
            return;
        }
        let Some(step) = self.step(node_id) else {
            return;
        };
        acc.retain(|id| id != node_id);
        acc.insert(0, node_id.to_string());
        for port in step.core().inputs().values() {
            if let Some(loc) = port.source() {
                self.collect_predecessors(&loc.node_id, acc);
            }
        }
    }

    // ─── Invocation ─────────────────────────────────────────────────────────

    /// Call the workflow: apply declared defaults to the input values,
    /// validate them, write them into the input ports, invoke all steps, and
    /// read back the output value(s).
    pub fn call(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        mut input_values: IndexMap<String, Value>,
    ) -> Result<Value> {
        self.core.op_meta().set_default_input_values(&mut input_values);
        self.core.op_meta().validate_input_values(&input_values)?;
        for (name, value) in input_values {
            if let Some(port) = self.core.input_mut(&name) {
                port.set_value(value);
            }
        }
        self.invoke(ctx)?;
        Ok(self.get_output_value())
    }

    /// Invoke every step in execution order.
    pub fn invoke(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let order = self.execution_order()?;
        self.invoke_indices(&order, ctx)
    }

    /// Invoke just the given steps, in the given order.
    pub fn invoke_steps(&mut self, step_ids: &[&str], ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let indices = step_ids
            .iter()
            .map(|id| {
                self.step_ids
                    .get(*id)
                    .copied()
                    .ok_or_else(|| WorkflowError::UnknownStep((*id).to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        self.invoke_indices(&indices, ctx)
    }

    fn invoke_indices(&mut self, indices: &[usize], ctx: &mut ExecutionContext<'_>) -> Result<()> {
        match indices.len() {
            0 => Ok(()),
            1 => {
                if ctx.monitor.is_cancelled() {
                    return Err(WorkflowError::Canceled);
                }
                self.invoke_step_at(indices[0], ctx)
            }
            step_count => {
                let parent_monitor = ctx.monitor.clone();
                parent_monitor.started(
                    &format!("Executing {step_count} workflow step(s)"),
                    step_count as f64,
                );
                for &index in indices {
                    if parent_monitor.is_cancelled() {
                        ctx.monitor = parent_monitor.clone();
                        return Err(WorkflowError::Canceled);
                    }
                    let child = ChildMonitor::shared(parent_monitor.clone(), 1.0);
                    ctx.monitor = child.clone();
                    let result = self.invoke_step_at(index, ctx);
                    ctx.monitor = parent_monitor.clone();
                    result?;
                    child.done();
                }
                parent_monitor.done();
                Ok(())
            }
        }
    }

    fn invoke_step_at(&mut self, index: usize, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let step_id = self.steps[index].id().to_string();
        debug!(workflow = %self.core.id(), step = %self.steps[index], "invoking step");

        // Gather input values by reading through the port sources.
        let mut input_values = IndexMap::new();
        for (name, port) in self.steps[index].core().inputs() {
            if name == MONITOR_INPUT_NAME {
                continue;
            }
            if let Some(value) = self.chase_port(port) {
                input_values.insert(name.clone(), value);
            }
        }

        let mut context_values = ctx.values.clone();
        context_values.insert(
            "workflow_id".to_string(),
            Value::Str(self.core.id().to_string()),
        );
        context_values.insert("step_id".to_string(), Value::Str(step_id.clone()));
        apply_context_inputs(
            self.steps[index].core().op_meta(),
            &context_values,
            ctx.evaluator.as_ref(),
            &mut input_values,
        );

        let outputs = self.steps[index].invoke_impl(input_values, ctx)?;

        let step = &mut self.steps[index];
        for (name, value) in outputs {
            match step.core_mut().output_mut(&name) {
                Some(port) => port.set_value(value),
                None => warn!(step = %step_id, output = %name, "step produced an undeclared output"),
            }
        }
        Ok(())
    }

    // ─── Serialization ──────────────────────────────────────────────────────

    /// Load a workflow from a JSON file.
    pub fn load(path: &Path, registry: &OpRegistry) -> Result<Workflow> {
        let text = fs::read_to_string(path)?;
        let json: serde_json::Value = serde_json::from_str(&text)?;
        Self::from_json_value(&json, registry)
    }

    /// Store the workflow as a pretty-printed JSON file.
    pub fn store(&self, path: &Path) -> Result<()> {
        let json = self.to_json_value()?;
        fs::write(path, serde_json::to_string_pretty(&json)?)?;
        Ok(())
    }

    pub fn from_json_value(json: &serde_json::Value, registry: &OpRegistry) -> Result<Workflow> {
        let entries = json.as_object().ok_or_else(|| {
            WorkflowError::InvalidEncoding("workflow JSON is not an object".to_string())
        })?;

        if let Some(version) = entries
            .get(WORKFLOW_SCHEMA_VERSION_TAG)
            .and_then(serde_json::Value::as_i64)
        {
            if version > WORKFLOW_SCHEMA_VERSION {
                warn!(version, "workflow schema version is newer than supported");
            }
        }

        let qualified_name = entries
            .get("qualified_name")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                WorkflowError::InvalidEncoding(
                    "missing mandatory property \"qualified_name\" in workflow JSON".to_string(),
                )
            })?;

        let mut meta = OpMetaInfo::new(qualified_name);
        if let Some(header) = entries.get("header").and_then(serde_json::Value::as_object) {
            for (key, value) in header {
                meta.header_mut().insert(key.clone(), value.clone());
            }
        }

        let inputs_json = entries
            .get("inputs")
            .and_then(serde_json::Value::as_object)
            .cloned()
            .unwrap_or_default();
        let outputs_json = entries
            .get("outputs")
            .and_then(serde_json::Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (name, port_json) in &inputs_json {
            meta = meta.with_input(name, port_metadata(port_json)?);
        }
        for (name, port_json) in &outputs_json {
            meta = meta.with_output(name, port_metadata(port_json)?);
        }

        let mut workflow = Workflow::new(meta);
        if let Some(steps) = entries.get("steps").and_then(serde_json::Value::as_array) {
            for (index, step_json) in steps.iter().enumerate() {
                let step = Step::from_json(step_json, index, registry)?;
                workflow.add_step(step, false)?;
            }
        }

        let owner = workflow.core.id().to_string();
        for (name, port_json) in &inputs_json {
            workflow
                .core
                .input_mut(name)
                .expect("input port from meta")
                .from_json(&owner, Some(port_json))?;
        }
        for (name, port_json) in &outputs_json {
            workflow
                .core
                .output_mut(name)
                .expect("output port from meta")
                .from_json(&owner, Some(port_json))?;
        }

        workflow.update_sources()?;
        Ok(workflow)
    }

    pub fn to_json_value(&self) -> Result<serde_json::Value> {
        let mut inputs = serde_json::Map::new();
        for (name, port) in self.core.inputs() {
            let props = self.core.op_meta().inputs().get(name);
            inputs.insert(name.clone(), workflow_port_json(port, false, props)?);
        }
        let mut outputs = serde_json::Map::new();
        for (name, port) in self.core.outputs() {
            let props = self.core.op_meta().outputs().get(name);
            outputs.insert(name.clone(), workflow_port_json(port, true, props)?);
        }

        let mut steps = Vec::new();
        for step in &self.steps {
            steps.push(step.to_json()?);
        }

        let mut entries = serde_json::Map::new();
        entries.insert(
            WORKFLOW_SCHEMA_VERSION_TAG.to_string(),
            serde_json::json!(WORKFLOW_SCHEMA_VERSION),
        );
        entries.insert(
            "qualified_name".to_string(),
            serde_json::json!(self.core.op_meta().qualified_name()),
        );
        entries.insert(
            "header".to_string(),
            serde_json::Value::Object(
                self.core
                    .op_meta()
                    .header()
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            ),
        );
        entries.insert("inputs".to_string(), serde_json::Value::Object(inputs));
        entries.insert("outputs".to_string(), serde_json::Value::Object(outputs));
        entries.insert("steps".to_string(), serde_json::Value::Array(steps));
        Ok(serde_json::Value::Object(entries))
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Workflow({:?})", self.core.op_meta().qualified_name())
    }
}

/// Metadata half of a workflow-level port JSON entry.
fn port_metadata(port_json: &serde_json::Value) -> Result<PortProps> {
    match port_json {
        serde_json::Value::Object(entries) => {
            let metadata: serde_json::Map<String, serde_json::Value> = entries
                .iter()
                .filter(|(key, _)| key.as_str() != "source" && key.as_str() != "value")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            if metadata.is_empty() {
                return Ok(PortProps::default());
            }
            Ok(serde_json::from_value(serde_json::Value::Object(metadata))?)
        }
        _ => Ok(PortProps::default()),
    }
}

/// Workflow-level ports always serialize as objects merging the binding with
/// the declared metadata.
fn workflow_port_json(
    port: &NodePort,
    is_output: bool,
    props: Option<&PortProps>,
) -> Result<serde_json::Value> {
    let binding = port.to_json(is_output, true)?;
    let mut entries = match binding {
        serde_json::Value::Object(entries) => entries,
        other => {
            return Err(WorkflowError::InvalidEncoding(format!(
                "unexpected port encoding: {other}"
            )))
        }
    };
    if let Some(props) = props {
        if !props.is_empty() {
            if let serde_json::Value::Object(props_entries) = serde_json::to_value(props)? {
                entries.extend(props_entries);
            }
        }
    }
    Ok(serde_json::Value::Object(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Operation;
    use crate::types::DataType;

    fn test_registry() -> OpRegistry {
        let mut registry = OpRegistry::new();

        let double = OpMetaInfo::new("test.double")
            .with_input(
                "x",
                PortProps {
                    data_type: Some(DataType::Int),
                    ..Default::default()
                },
            )
            .with_return_output();
        registry
            .add_op(
                Operation::new(double, |inputs, _monitor| {
                    Ok(Value::Int(2 * inputs["x"].as_i64().unwrap_or(0)))
                }),
                true,
            )
            .expect("double registers");

        let split = OpMetaInfo::new("test.split")
            .with_input("x", PortProps::default())
            .with_output("low", PortProps::default())
            .with_output("high", PortProps::default());
        registry
            .add_op(
                Operation::new(split, |inputs, _monitor| {
                    let x = inputs["x"].as_i64().unwrap_or(0);
                    let mut outputs = IndexMap::new();
                    outputs.insert("low".to_string(), Value::Int(x / 2));
                    outputs.insert("high".to_string(), Value::Int(x - x / 2));
                    Ok(Value::Object(outputs))
                }),
                true,
            )
            .expect("split registers");

        registry
    }

    fn workflow_meta() -> OpMetaInfo {
        OpMetaInfo::new("test_wf")
            .with_input("x", PortProps::default())
            .with_output("y", PortProps::default())
    }

    fn linear_workflow(registry: &OpRegistry) -> Workflow {
        let mut workflow = Workflow::new(workflow_meta());

        let mut step_1 = Step::op("test.double", Some("step_1"), registry).expect("step_1");
        step_1
            .core_mut()
            .input_mut("x")
            .expect("port x")
            .set_source_ref(SourceRef::parse("test_wf.x").expect("ref"));
        let mut step_2 = Step::op("test.double", Some("step_2"), registry).expect("step_2");
        step_2
            .core_mut()
            .input_mut("x")
            .expect("port x")
            .set_source_ref(SourceRef::parse("step_1.return").expect("ref"));

        workflow.add_steps([step_1, step_2]).expect("steps add");
        workflow
            .output_mut("y")
            .expect("port y")
            .set_source_ref(SourceRef::parse("step_2").expect("ref"));
        workflow.update_sources().expect("resolution succeeds");
        workflow
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let registry = test_registry();
        let mut workflow = Workflow::new(workflow_meta());
        workflow
            .add_step(
                Step::op("test.double", Some("s"), &registry).expect("step"),
                false,
            )
            .expect("first add succeeds");

        let err = workflow
            .add_step(
                Step::op("test.double", Some("s"), &registry).expect("step"),
                false,
            )
            .expect_err("duplicate id should be rejected");
        assert!(matches!(err, WorkflowError::DuplicateStepId(ref id) if id == "s"));
    }

    #[test]
    fn test_resolution_binds_ports() {
        let registry = test_registry();
        let workflow = linear_workflow(&registry);

        let step_2 = workflow.step("step_2").expect("step_2");
        let loc = step_2
            .core()
            .input("x")
            .expect("port x")
            .source()
            .expect("resolved");
        assert_eq!(loc, &PortLoc::new("step_1", "return", PortSpace::Output));

        let y = workflow.core().output("y").expect("port y");
        assert_eq!(
            y.source().expect("resolved"),
            &PortLoc::new("step_2", "return", PortSpace::Output)
        );
    }

    #[test]
    fn test_resolution_error_kinds() {
        let registry = test_registry();

        let mut workflow = Workflow::new(workflow_meta());
        workflow
            .output_mut("y")
            .expect("port y")
            .set_source_ref(SourceRef::parse("ghost.return").expect("ref"));
        let err = workflow.update_sources().expect_err("unknown node");
        assert!(matches!(err, WorkflowError::UnknownNode { ref node_id, .. } if node_id == "ghost"));

        let mut workflow = Workflow::new(workflow_meta());
        workflow
            .add_step(
                Step::op("test.double", Some("s"), &registry).expect("step"),
                false,
            )
            .expect("add");
        workflow
            .output_mut("y")
            .expect("port y")
            .set_source_ref(SourceRef::parse("s.nope").expect("ref"));
        let err = workflow.update_sources().expect_err("unknown port");
        assert!(matches!(err, WorkflowError::UnknownPort { ref name, .. } if name == "nope"));

        let mut workflow = Workflow::new(workflow_meta());
        workflow
            .add_step(
                Step::op("test.split", Some("s"), &registry).expect("step"),
                false,
            )
            .expect("add");
        workflow
            .output_mut("y")
            .expect("port y")
            .set_source_ref(SourceRef::parse("s").expect("ref"));
        let err = workflow.update_sources().expect_err("ambiguous node");
        assert!(matches!(err, WorkflowError::AmbiguousNode { output_count: 2, .. }));

        let mut workflow = Workflow::new(workflow_meta());
        let mut step = Step::op("test.double", Some("s"), &registry).expect("step");
        step.core_mut()
            .input_mut("x")
            .expect("port x")
            .set_source_ref(SourceRef::parse(".nowhere").expect("ref"));
        workflow.add_step(step, false).expect("add");
        let err = workflow.update_sources().expect_err("unknown port in scope");
        assert!(
            matches!(err, WorkflowError::UnknownPortInScope { ref name, .. } if name == "nowhere")
        );

        let mut workflow = Workflow::new(workflow_meta());
        workflow
            .input_mut("x")
            .expect("port x")
            .set_source_ref(SourceRef::parse("test_wf.x").expect("ref"));
        let err = workflow.update_sources().expect_err("self binding");
        assert!(matches!(err, WorkflowError::SelfBinding(_)));
    }

    #[test]
    fn test_single_output_shortcut() {
        let registry = test_registry();
        let workflow = linear_workflow(&registry);

        // "step_2" resolved to its single output via the node-id-only form.
        let y = workflow.core().output("y").expect("port y");
        assert_eq!(y.source().expect("resolved").port_name, RETURN_OUTPUT_NAME);
    }

    #[test]
    fn test_dotted_form_resolves_against_parent_scope() {
        let registry = test_registry();
        let mut workflow = Workflow::new(workflow_meta());
        let mut step = Step::op("test.double", Some("s"), &registry).expect("step");
        step.core_mut()
            .input_mut("x")
            .expect("port x")
            .set_source_ref(SourceRef::parse(".x").expect("ref"));
        workflow.add_step(step, false).expect("add");
        workflow.update_sources().expect("resolution succeeds");

        let loc = workflow
            .step("s")
            .expect("step")
            .core()
            .input("x")
            .expect("port x")
            .source()
            .expect("resolved")
            .clone();
        assert_eq!(loc, PortLoc::new("test_wf", "x", PortSpace::Input));
    }

    #[test]
    fn test_rename_cascades_through_tree() {
        let registry = test_registry();
        let mut workflow = linear_workflow(&registry);

        workflow
            .rename_node("step_1", "src")
            .expect("rename succeeds");

        assert!(workflow.step("step_1").is_none());
        assert!(workflow.step("src").is_some());
        let loc = workflow
            .step("step_2")
            .expect("step_2")
            .core()
            .input("x")
            .expect("port x")
            .source()
            .expect("resolved")
            .clone();
        assert_eq!(loc.node_id, "src");

        let err = workflow
            .rename_node("src", "step_2")
            .expect_err("rename onto sibling id");
        assert!(matches!(err, WorkflowError::DuplicateStepId(_)));

        let err = workflow
            .rename_node("ghost", "anything")
            .expect_err("rename of unknown node");
        assert!(matches!(err, WorkflowError::UnknownStep(_)));

        let err = workflow.rename_node("src", "").expect_err("empty id");
        assert!(matches!(err, WorkflowError::InvalidEncoding(_)));
    }

    #[test]
    fn test_replacement_rebinds_like_named_ports() {
        let registry = test_registry();
        let mut workflow = linear_workflow(&registry);

        let replacement = Step::op("test.double", Some("step_1"), &registry).expect("step");
        let old = workflow
            .add_step(replacement, true)
            .expect("replacement succeeds")
            .expect("old step returned");
        assert_eq!(old.id(), "step_1");

        // step_2 still reads step_1.return, now bound to the new step.
        let loc = workflow
            .step("step_2")
            .expect("step_2")
            .core()
            .input("x")
            .expect("port x")
            .source()
            .expect("still resolved")
            .clone();
        assert_eq!(loc.node_id, "step_1");
    }

    #[test]
    fn test_replacement_clears_unbindable_ports() {
        let registry = test_registry();
        let mut workflow = linear_workflow(&registry);

        // The replacement has two outputs, so the short-form binding of the
        // workflow output ("step_2") no longer resolves.
        let replacement = Step::op("test.split", Some("step_2"), &registry).expect("step");
        workflow
            .add_step(replacement, true)
            .expect("replacement succeeds");

        let y = workflow.core().output("y").expect("port y");
        assert!(y.source().is_none());
        assert!(y.source_ref().is_none());
        assert!(y.value().is_undefined());
    }

    #[test]
    fn test_replacement_without_can_exist_fails() {
        let registry = test_registry();
        let mut workflow = linear_workflow(&registry);

        let err = workflow
            .add_step(
                Step::op("test.double", Some("step_1"), &registry).expect("step"),
                false,
            )
            .expect_err("existing id without can_exist");
        assert!(matches!(err, WorkflowError::DuplicateStepId(_)));
    }

    #[test]
    fn test_remove_step_clears_dependents() {
        let registry = test_registry();
        let mut workflow = linear_workflow(&registry);

        let removed = workflow
            .remove_step("step_1", true)
            .expect("removal succeeds")
            .expect("step returned");
        assert_eq!(removed.id(), "step_1");

        let x = workflow
            .step("step_2")
            .expect("step_2")
            .core()
            .input("x")
            .expect("port x");
        assert!(x.source().is_none());
        assert!(x.value().is_undefined());

        assert!(workflow
            .remove_step("step_1", false)
            .expect("lenient removal")
            .is_none());
        let err = workflow
            .remove_step("step_1", true)
            .expect_err("strict removal of missing step");
        assert!(matches!(err, WorkflowError::UnknownStep(_)));
    }

    #[test]
    fn test_diamond_execution_order() {
        let registry = test_registry();
        let mut workflow = Workflow::new(workflow_meta());

        let make = |id: &str, source: Option<&str>| {
            let mut step = Step::op("test.double", Some(id), &registry).expect("step");
            if let Some(source) = source {
                step.core_mut()
                    .input_mut("x")
                    .expect("port x")
                    .set_source_ref(SourceRef::parse(source).expect("ref"));
            }
            step
        };

        let a = make("a", None);
        let b = make("b", Some("a.return"));
        let c = make("c", Some("a.return"));
        let mut d = Step::op("test.split", Some("d"), &registry).expect("step d");
        d.core_mut()
            .input_mut("x")
            .expect("port x")
            .set_source_ref(SourceRef::parse("b.return").expect("ref"));
        d.core_mut().ensure_input("y").set_source_ref(
            SourceRef::parse("c.return").expect("ref"),
        );

        // Insertion order deliberately scrambled.
        workflow.add_steps([d, c, b, a]).expect("steps add");
        workflow.update_sources().expect("resolution succeeds");

        let order: Vec<&str> = workflow
            .sorted_steps()
            .expect("acyclic")
            .iter()
            .map(|step| step.id())
            .collect();
        assert_eq!(order, vec!["a", "c", "b", "d"], "ties keep insertion order");

        assert!(workflow.requires("d", "a"));
        assert!(!workflow.requires("a", "d"));
        assert_eq!(workflow.max_distance("d", "a"), 2);
        assert_eq!(workflow.max_distance("d", "d"), 0);
        assert_eq!(workflow.max_distance("a", "d"), -1);
    }

    #[test]
    fn test_cycle_detection() {
        let registry = test_registry();
        let mut workflow = Workflow::new(workflow_meta());

        let mut a = Step::op("test.double", Some("a"), &registry).expect("step a");
        a.core_mut()
            .input_mut("x")
            .expect("port x")
            .set_source_ref(SourceRef::parse("b.return").expect("ref"));
        let mut b = Step::op("test.double", Some("b"), &registry).expect("step b");
        b.core_mut()
            .input_mut("x")
            .expect("port x")
            .set_source_ref(SourceRef::parse("a.return").expect("ref"));
        workflow.add_steps([a, b]).expect("steps add");
        workflow.update_sources().expect("resolution succeeds");

        let err = workflow.sorted_steps().expect_err("cycle should be caught");
        assert!(matches!(err, WorkflowError::CyclicGraph(_)));
    }

    #[test]
    fn test_cycle_detection_before_resolution() {
        let registry = test_registry();
        let mut workflow = Workflow::new(workflow_meta());

        let mut a = Step::op("test.double", Some("a"), &registry).expect("step a");
        a.core_mut()
            .input_mut("x")
            .expect("port x")
            .set_source_ref(SourceRef::parse("b.return").expect("ref"));
        let mut b = Step::op("test.double", Some("b"), &registry).expect("step b");
        b.core_mut()
            .input_mut("x")
            .expect("port x")
            .set_source_ref(SourceRef::parse("a.return").expect("ref"));
        workflow.add_steps([a, b]).expect("steps add");

        // Ordering requested before update_sources: the cycle exists only
        // through pending symbolic references and must still be caught.
        let err = workflow
            .sorted_steps()
            .expect_err("cycle through pending refs should be caught");
        assert!(matches!(err, WorkflowError::CyclicGraph(_)));
    }

    #[test]
    fn test_find_steps_to_compute() {
        let registry = test_registry();
        let mut workflow = Workflow::new(workflow_meta());

        let mut a = Step::op("test.double", Some("a"), &registry).expect("step a");
        a.core_mut()
            .input_mut("x")
            .expect("port x")
            .set_source_ref(SourceRef::parse("test_wf.x").expect("ref"));
        let mut b = Step::op("test.double", Some("b"), &registry).expect("step b");
        b.core_mut()
            .input_mut("x")
            .expect("port x")
            .set_source_ref(SourceRef::parse("a.return").expect("ref"));
        let unrelated = Step::op("test.double", Some("unrelated"), &registry).expect("step");

        workflow.add_steps([a, unrelated, b]).expect("steps add");
        workflow.update_sources().expect("resolution succeeds");

        let ids: Vec<&str> = workflow
            .find_steps_to_compute("b")
            .expect("closure")
            .iter()
            .map(|step| step.id())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let err = workflow
            .find_steps_to_compute("ghost")
            .expect_err("unknown step");
        assert!(matches!(err, WorkflowError::UnknownStep(_)));
    }

    #[test]
    fn test_json_round_trip() {
        let registry = test_registry();
        let workflow = linear_workflow(&registry);

        let json = workflow.to_json_value().expect("encode");
        assert_eq!(json["schema_version"], serde_json::json!(1));
        assert_eq!(json["qualified_name"], serde_json::json!("test_wf"));

        let restored = Workflow::from_json_value(&json, &registry).expect("decode");
        let json_again = restored.to_json_value().expect("re-encode");
        assert_eq!(json, json_again);
    }

    #[test]
    fn test_from_json_requires_qualified_name() {
        let registry = test_registry();
        let err = Workflow::from_json_value(&serde_json::json!({"steps": []}), &registry)
            .expect_err("missing qualified_name");
        assert!(matches!(err, WorkflowError::InvalidEncoding(_)));
    }
}
