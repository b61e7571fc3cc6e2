//! Variable table builder.
//!
//! Walks a lowered pipeline once, depth first, cross-referencing every call
//! against the tool registry and the parameter store. The resulting
//! [`VariableTable`] is immutable: it records which pool variables exist, which
//! memory slots they own, and the declared inputs/outputs of every tool the
//! pipeline can reach. Any unresolved reference aborts the build before a
//! single tool is invoked.

use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tracing::debug;
use weft_types::{
    CallStep, InvocationKey, InvocationKind, OutputTarget, PipelineDefinition, SourceExpr, Step, ToolRegistry, spec::LOCAL_PREFIX,
};

use crate::{error::CompileError, params::ParameterStore};

/// Prefix that turns a global reference into a read of the variable's history.
pub const MEMORY_PREFIX: &str = "memory_";

/// Canonical form of a global reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalName<'a> {
    /// Current pool value.
    Pool(&'a str),
    /// Every value the variable has held, oldest first.
    Memory(&'a str),
}

/// Where one declared output is read from in the tool response and written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputBinding {
    pub result_key: String,
    pub target: OutputTarget,
}

/// Declared interface of one tool plus the union of variables its call sites touch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableEntry {
    pub kind: InvocationKind,
    pub input: IndexMap<String, SourceExpr>,
    pub output: Vec<String>,
    pub reads: IndexSet<String>,
    pub writes: IndexSet<String>,
}

impl VariableEntry {
    /// Declared inputs with call-site overrides layered on top.
    pub fn effective_inputs(&self, overrides: &IndexMap<String, SourceExpr>) -> IndexMap<String, SourceExpr> {
        let mut inputs = self.input.clone();
        for (param, expr) in overrides {
            inputs.insert(param.clone(), expr.clone());
        }
        inputs
    }

    /// Resolves each declared output to its response key and destination.
    pub fn output_bindings(&self, overrides: &IndexMap<String, String>) -> Vec<OutputBinding> {
        self.output
            .iter()
            .map(|declared| {
                let result_key = declared.trim_start_matches(LOCAL_PREFIX).to_string();
                let target = overrides
                    .get(declared)
                    .or_else(|| overrides.get(&result_key))
                    .map(String::as_str)
                    .unwrap_or(declared);
                OutputBinding {
                    result_key,
                    target: OutputTarget::parse(target),
                }
            })
            .collect()
    }

    fn declares_output(&self, name: &str) -> bool {
        self.output
            .iter()
            .any(|declared| declared == name || declared.trim_start_matches(LOCAL_PREFIX) == name)
    }
}

/// Static variable map shared by every run of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VariableTable {
    entries: IndexMap<InvocationKey, VariableEntry>,
    pool_variables: IndexSet<String>,
    memory_slots: IndexSet<String>,
}

impl VariableTable {
    /// Builds the table, failing on the first unresolved or malformed reference.
    pub fn build(
        definition: &PipelineDefinition,
        registry: &ToolRegistry,
        parameters: &ParameterStore,
    ) -> Result<Self, CompileError> {
        let mut builder = TableBuilder {
            registry,
            parameters,
            table: VariableTable::default(),
            locals: HashSet::new(),
        };
        builder.walk(&definition.steps)?;
        debug!(
            tools = builder.table.entries.len(),
            variables = builder.table.pool_variables.len(),
            "variable table built"
        );
        Ok(builder.table)
    }

    pub fn entry(&self, key: &InvocationKey) -> Option<&VariableEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&InvocationKey, &VariableEntry)> {
        self.entries.iter()
    }

    /// Pool variables in declaration order.
    pub fn pool_variables(&self) -> impl Iterator<Item = &str> {
        self.pool_variables.iter().map(String::as_str)
    }

    pub fn memory_slots(&self) -> impl Iterator<Item = &str> {
        self.memory_slots.iter().map(String::as_str)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.pool_variables.contains(name)
    }

    /// Canonicalizes a global reference; exact pool names win over the memory alias.
    pub fn classify<'a>(&self, name: &'a str) -> Option<GlobalName<'a>> {
        classify_global(&self.pool_variables, name)
    }
}

fn classify_global<'a>(declared: &IndexSet<String>, name: &'a str) -> Option<GlobalName<'a>> {
    if declared.contains(name) {
        return Some(GlobalName::Pool(name));
    }
    name.strip_prefix(MEMORY_PREFIX)
        .filter(|base| declared.contains(*base))
        .map(GlobalName::Memory)
}

struct TableBuilder<'a> {
    registry: &'a ToolRegistry,
    parameters: &'a ParameterStore,
    table: VariableTable,
    /// `(server, name)` pairs written to a local store by an earlier call.
    locals: HashSet<(String, String)>,
}

impl TableBuilder<'_> {
    fn walk(&mut self, steps: &[Step]) -> Result<(), CompileError> {
        for step in steps {
            match step {
                Step::Call(call) => self.register_call(call)?,
                Step::Loop(looped) => self.walk(&looped.body)?,
                Step::Branch(branch) => {
                    self.walk(&branch.router)?;
                    for arm in branch.arms.values() {
                        self.walk(arm)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn register_call(&mut self, call: &CallStep) -> Result<(), CompileError> {
        let key = &call.key;
        let Some((kind, spec)) = self.registry.lookup(key) else {
            let reason = if self.registry.has_server(&key.server) {
                format!("server '{}' declares no tool or prompt named '{}'", key.server, key.tool)
            } else {
                format!("unknown server '{}'", key.server)
            };
            return Err(CompileError::malformed(key, reason));
        };

        if kind == InvocationKind::Prompt && spec.output.len() != 1 {
            return Err(CompileError::malformed(key, "prompts must declare exactly one output"));
        }

        let entry = self.table.entries.entry(key.clone()).or_insert_with(|| VariableEntry {
            kind,
            input: spec.input.clone(),
            output: spec.output.clone(),
            reads: IndexSet::new(),
            writes: IndexSet::new(),
        });

        if let Some(param) = call.input_overrides.keys().find(|param| !entry.input.contains_key(*param)) {
            return Err(CompileError::malformed(key, format!("unknown input parameter '{param}'")));
        }
        if let Some(name) = call.output_overrides.keys().find(|name| !entry.declares_output(name)) {
            return Err(CompileError::malformed(key, format!("unknown output '{name}'")));
        }

        let inputs = entry.effective_inputs(&call.input_overrides);
        let bindings = entry.output_bindings(&call.output_overrides);

        let mut reads = Vec::new();
        for expr in inputs.values() {
            match expr {
                SourceExpr::Literal(_) => {}
                SourceExpr::LocalRef(name) => {
                    let declared_locally = self.locals.contains(&(key.server.clone(), name.clone()));
                    if !declared_locally && !self.parameters.contains(&key.server, name) {
                        return Err(CompileError::unresolved_local(key, name.clone()));
                    }
                }
                SourceExpr::GlobalRef(name) => {
                    let canonical = match classify_global(&self.table.pool_variables, name) {
                        Some(GlobalName::Pool(base)) | Some(GlobalName::Memory(base)) => base.to_string(),
                        None => return Err(CompileError::unresolved_global(key, name.clone())),
                    };
                    self.table.memory_slots.insert(canonical);
                    reads.push(name.clone());
                }
            }
        }

        if let Some(skeleton) = &call.skeleton
            && !self.table.pool_variables.contains(skeleton)
        {
            return Err(CompileError::unresolved_global(key, skeleton.clone()));
        }

        let mut writes = Vec::with_capacity(bindings.len());
        for binding in bindings {
            match &binding.target {
                OutputTarget::Global(name) => {
                    self.table.pool_variables.insert(name.clone());
                }
                OutputTarget::Local(name) => {
                    self.locals.insert((key.server.clone(), name.clone()));
                }
            }
            let record_name = binding.target.record_name();
            self.table.memory_slots.insert(record_name.clone());
            writes.push(record_name);
        }

        if let Some(entry) = self.table.entries.get_mut(key) {
            entry.reads.extend(reads);
            entry.writes.extend(writes);
        }
        Ok(())
    }
}
