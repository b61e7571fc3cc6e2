use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;
use weft_types::{LaneCountMismatch, OutputTarget, PoolValue, Snapshot, WrappedSequence};

use super::{ExecutionState, StepWrite, WriteMode, WriteOutcome};
use crate::error::{CompileError, EngineError};

/// One output of a call, computed but not yet committed.
enum Staged {
    Local { name: String, value: Value },
    Global { name: String, value: PoolValue },
}

impl ExecutionState {
    /// Stores a call response according to its declared outputs.
    ///
    /// At the root the pool value is replaced outright. Inside an arm only the
    /// lanes selected by the branch path are written, padding against a skeleton
    /// when the variable has no lanes on this path yet. Router writes tag the lanes with
    /// their selected state and copy those tags onto every other wrapped variable
    /// of the same width. Each write appends to memory; the call appends one snapshot.
    ///
    /// Every output is computed before anything is stored, so a failing call
    /// leaves the pool, memory, parameters, and snapshots untouched.
    pub fn put(&mut self, write: StepWrite<'_>) -> Result<WriteOutcome, EngineError> {
        let table = Arc::clone(&self.table);
        let entry = table
            .entry(write.key)
            .ok_or_else(|| CompileError::malformed(write.key, "not present in the variable table"))?;

        let mut outcome = WriteOutcome::default();
        let mut staged = Vec::new();

        for binding in entry.output_bindings(write.output_overrides) {
            let produced = write
                .response
                .get(&binding.result_key)
                .ok_or_else(|| EngineError::malformed_output(write.key, &binding.result_key, "missing from tool response"))?;

            let output = match &binding.target {
                OutputTarget::Local(name) => Staged::Local {
                    name: name.clone(),
                    value: produced.clone(),
                },
                OutputTarget::Global(name) => {
                    let value = match write.mode {
                        WriteMode::Router { depth } => self.routed_value(&write, name, produced, depth, &mut outcome.states)?,
                        WriteMode::Plain if write.path.is_root() => PoolValue::from_json(produced.clone()),
                        WriteMode::Plain => self.nested_value(&write, name, produced)?,
                    };
                    Staged::Global { name: name.clone(), value }
                }
            };
            staged.push((binding.target.record_name(), output));
        }

        let mut memory_delta = IndexMap::new();
        for (record_name, output) in staged {
            let recorded = match output {
                Staged::Local { name, value } => {
                    self.parameters.set(&write.key.server, &name, value.clone());
                    value
                }
                Staged::Global { name, value } => {
                    if let (WriteMode::Router { .. }, PoolValue::Wrapped(wrapped)) = (write.mode, &value) {
                        self.propagate_tags(&name, wrapped, &write);
                    }
                    let recorded = value.to_json();
                    self.pool.insert(name, value);
                    recorded
                }
            };
            self.memory.entry(record_name.clone()).or_default().push(recorded.clone());
            memory_delta.insert(record_name, recorded);
        }

        self.snapshots.push(Snapshot {
            step: write.key.clone(),
            memory_delta,
        });
        Ok(outcome)
    }

    fn nested_value(&self, write: &StepWrite<'_>, name: &str, produced: &Value) -> Result<PoolValue, EngineError> {
        let items = produced
            .as_array()
            .cloned()
            .ok_or_else(|| EngineError::malformed_output(write.key, name, "expected a list of per-lane values"))?;

        if let Some(PoolValue::Wrapped(existing)) = self.pool.get(name)
            && existing.matching_len(write.path) > 0
        {
            let mut updated = existing.clone();
            updated
                .fill_matching(write.path, items)
                .map_err(|mismatch| length_mismatch(write, name, mismatch))?;
            return Ok(PoolValue::Wrapped(updated));
        }

        let mut padded = WrappedSequence::skeleton_of(self.skeleton_for(write, name, items.len())?);
        padded
            .fill_matching(write.path, items)
            .map_err(|mismatch| length_mismatch(write, name, mismatch))?;
        Ok(PoolValue::Wrapped(padded))
    }

    fn routed_value(
        &self,
        write: &StepWrite<'_>,
        name: &str,
        produced: &Value,
        depth: usize,
        states: &mut Vec<String>,
    ) -> Result<PoolValue, EngineError> {
        let entries = parse_routed_lanes(write, name, produced)?;
        for (_, state) in &entries {
            if !states.contains(state) {
                states.push(state.clone());
            }
        }

        let tag_depth = depth + 1;
        let reusable = self
            .pool
            .get(name)
            .and_then(PoolValue::as_wrapped)
            .filter(|existing| existing.matching_len(write.path) == entries.len())
            .cloned();

        let wrapped = match reusable {
            Some(mut existing) => {
                existing
                    .route_matching(write.path, tag_depth, entries)
                    .map_err(|mismatch| length_mismatch(write, name, mismatch))?;
                existing
            }
            None if write.path.is_root() => WrappedSequence::routed(entries, tag_depth),
            None => {
                let mut padded = WrappedSequence::skeleton_of(self.skeleton_for(write, name, entries.len())?);
                padded
                    .route_matching(write.path, tag_depth, entries)
                    .map_err(|mismatch| length_mismatch(write, name, mismatch))?;
                padded
            }
        };

        Ok(PoolValue::Wrapped(wrapped))
    }

    /// Copies the router's lane tags onto every other wrapped variable of equal width.
    fn propagate_tags(&mut self, name: &str, source: &WrappedSequence, write: &StepWrite<'_>) {
        let indices = source.matching_indices(write.path);
        for (other, value) in self.pool.iter_mut() {
            if other == name {
                continue;
            }
            if let PoolValue::Wrapped(wrapped) = value
                && wrapped.len() == source.len()
            {
                wrapped.copy_tags_from(source, &indices);
                debug!(step = %write.key, router = name, variable = %other, "propagated branch tags");
            }
        }
    }

    /// Picks the lane layout a partial result is padded against.
    ///
    /// An explicit skeleton named by the call wins. Otherwise the first other
    /// wrapped variable (in declaration order) exposing exactly `lanes` lanes on
    /// this path is used.
    fn skeleton_for(&self, write: &StepWrite<'_>, name: &str, lanes: usize) -> Result<&WrappedSequence, EngineError> {
        if let Some(explicit) = write.skeleton {
            let wrapped = self
                .pool
                .get(explicit)
                .and_then(PoolValue::as_wrapped)
                .ok_or_else(|| EngineError::SkeletonUnavailable {
                    step: write.key.clone(),
                    variable: name.to_string(),
                })?;
            let matching = wrapped.matching_len(write.path);
            if matching != lanes {
                return Err(length_mismatch(
                    write,
                    name,
                    LaneCountMismatch {
                        expected: matching,
                        actual: lanes,
                    },
                ));
            }
            return Ok(wrapped);
        }

        self.pool
            .iter()
            .filter(|(other, _)| other.as_str() != name)
            .filter_map(|(other, value)| value.as_wrapped().map(|wrapped| (other, wrapped)))
            .find(|(_, wrapped)| wrapped.matching_len(write.path) == lanes)
            .map(|(other, wrapped)| {
                debug!(step = %write.key, variable = name, skeleton = %other, path = %write.path, "padding against skeleton");
                wrapped
            })
            .ok_or_else(|| EngineError::SkeletonUnavailable {
                step: write.key.clone(),
                variable: name.to_string(),
            })
    }
}

fn length_mismatch(write: &StepWrite<'_>, name: &str, mismatch: LaneCountMismatch) -> EngineError {
    EngineError::LengthMismatch {
        step: write.key.clone(),
        variable: name.to_string(),
        expected: mismatch.expected,
        actual: mismatch.actual,
    }
}

/// Router output is a list of `{ data, state }` objects, one per lane.
fn parse_routed_lanes(write: &StepWrite<'_>, name: &str, produced: &Value) -> Result<Vec<(Value, String)>, EngineError> {
    let items = produced
        .as_array()
        .ok_or_else(|| EngineError::malformed_output(write.key, name, "router output must be a list of {data, state} lanes"))?;

    items
        .iter()
        .map(|item| {
            let state = item
                .get("state")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::malformed_output(write.key, name, "router lane is missing a string 'state'"))?;
            let data = item.get("data").cloned().unwrap_or(Value::Null);
            Ok((data, state.to_string()))
        })
        .collect()
}
