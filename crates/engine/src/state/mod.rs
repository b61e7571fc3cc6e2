//! Execution state store.
//!
//! One [`ExecutionState`] exists per run. It owns the global variable pool, the
//! append-only memory pool, the run-local copy of the parameter store, and the
//! snapshot trail. Reads go through [`ExecutionState::get`] and writes through
//! [`ExecutionState::put`]; both honour the branch path of the calling frame so
//! that arms only ever see and write their own lanes.

mod resolve;
mod write;

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Value};
use weft_types::{BranchPath, InvocationKey, InvocationKind, PoolValue, Snapshot};

use crate::{params::ParameterStore, table::VariableTable};

/// Inputs resolved for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub key: InvocationKey,
    pub kind: InvocationKind,
    pub arguments: JsonMap<String, Value>,
    /// True when every wrapped input is empty for the current lanes: nothing to do.
    pub signal: bool,
}

/// How a call's response is merged into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Plain,
    /// Branch router; lanes are tagged at `depth + 1`.
    Router { depth: usize },
}

/// Everything [`ExecutionState::put`] needs to store one response.
#[derive(Debug, Clone, Copy)]
pub struct StepWrite<'a> {
    pub key: &'a InvocationKey,
    pub path: &'a BranchPath,
    pub response: &'a Value,
    pub output_overrides: &'a IndexMap<String, String>,
    pub skeleton: Option<&'a str>,
    pub mode: WriteMode,
}

/// Result of a write. Routers report the distinct states they assigned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub states: Vec<String>,
}

/// Per-run variable pool, memory pool, and snapshot trail.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    table: Arc<VariableTable>,
    parameters: ParameterStore,
    pool: IndexMap<String, PoolValue>,
    memory: IndexMap<String, Vec<Value>>,
    snapshots: Vec<Snapshot>,
}

impl ExecutionState {
    /// Creates an empty pool with one slot per declared variable.
    pub fn new(table: Arc<VariableTable>, parameters: ParameterStore) -> Self {
        let pool = table
            .pool_variables()
            .map(|name| (name.to_string(), PoolValue::default()))
            .collect();
        let memory = table.memory_slots().map(|name| (name.to_string(), Vec::new())).collect();
        Self {
            table,
            parameters,
            pool,
            memory,
            snapshots: Vec::new(),
        }
    }

    pub fn table(&self) -> &VariableTable {
        &self.table
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    pub fn value(&self, name: &str) -> Option<&PoolValue> {
        self.pool.get(name)
    }

    pub fn pool(&self) -> &IndexMap<String, PoolValue> {
        &self.pool
    }

    /// Every value `name` has held, oldest first.
    pub fn memory(&self, name: &str) -> &[Value] {
        self.memory.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn memory_pool(&self) -> &IndexMap<String, Vec<Value>> {
        &self.memory
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn into_parts(self) -> (IndexMap<String, PoolValue>, IndexMap<String, Vec<Value>>, Vec<Snapshot>) {
        (self.pool, self.memory, self.snapshots)
    }

    #[cfg(test)]
    pub(crate) fn seed(&mut self, name: &str, value: PoolValue) {
        self.pool.insert(name.to_string(), value);
    }
}
