use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Value};
use weft_types::{BranchPath, InvocationKey, PoolValue, SourceExpr};

use super::{ExecutionState, Resolution};
use crate::{
    error::{CompileError, EngineError},
    table::GlobalName,
};

impl ExecutionState {
    /// Resolves the arguments of `key` for the lanes selected by `path`.
    ///
    /// Wrapped inputs are narrowed to the matching, written lanes. The returned
    /// signal is set only when at least one input is wrapped and none of them has
    /// a live lane left.
    pub fn get(
        &self,
        key: &InvocationKey,
        path: &BranchPath,
        input_overrides: &IndexMap<String, SourceExpr>,
    ) -> Result<Resolution, EngineError> {
        let entry = self
            .table
            .entry(key)
            .ok_or_else(|| CompileError::malformed(key, "not present in the variable table"))?;

        let mut arguments = JsonMap::new();
        let mut wrapped_inputs = 0usize;
        let mut live_inputs = 0usize;

        for (param, expr) in entry.effective_inputs(input_overrides) {
            let value = match expr {
                SourceExpr::Literal(value) => value,
                SourceExpr::LocalRef(name) => self
                    .parameters
                    .get(&key.server, &name)
                    .cloned()
                    .ok_or_else(|| EngineError::UnboundLocal {
                        step: key.clone(),
                        name,
                    })?,
                SourceExpr::GlobalRef(name) => match self.table.classify(&name) {
                    Some(GlobalName::Memory(base)) => Value::Array(self.memory(base).to_vec()),
                    Some(GlobalName::Pool(base)) => match self.pool.get(base) {
                        Some(PoolValue::Wrapped(wrapped)) => {
                            wrapped_inputs += 1;
                            let lanes = wrapped.filtered(path);
                            if !lanes.is_empty() {
                                live_inputs += 1;
                            }
                            Value::Array(lanes)
                        }
                        Some(value) => value.to_json(),
                        None => return Err(CompileError::unresolved_global(key, base).into()),
                    },
                    None => return Err(CompileError::unresolved_global(key, name.as_str()).into()),
                },
            };
            arguments.insert(param, value);
        }

        Ok(Resolution {
            key: key.clone(),
            kind: entry.kind,
            arguments,
            signal: wrapped_inputs > 0 && live_inputs == 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use weft_types::{InvocationKind, LaneRecord, LaneTags, WrappedSequence};

    use super::*;
    use crate::state::fixtures::lane_state;

    fn key(raw: &str) -> InvocationKey {
        raw.parse().expect("key")
    }

    #[test]
    fn resolves_plain_and_local_inputs_at_root() {
        let mut state = lane_state();
        state.seed("items", PoolValue::Sequence(vec![json!(1), json!(2)]));

        let resolution = state.get(&key("a.label"), &BranchPath::root(), &IndexMap::new()).expect("resolve");
        assert_eq!(resolution.kind, InvocationKind::Tool);
        assert_eq!(resolution.arguments["items"], json!([1, 2]));
        assert_eq!(resolution.arguments["prefix"], json!("n"));
        assert!(!resolution.signal);
    }

    #[test]
    fn overrides_take_precedence_over_declared_inputs() {
        let state = lane_state();
        let overrides = IndexMap::from([("prefix".to_string(), SourceExpr::Literal(json!("x")))]);
        let resolution = state.get(&key("a.label"), &BranchPath::root(), &overrides).expect("resolve");
        assert_eq!(resolution.arguments["prefix"], json!("x"));
    }

    #[test]
    fn wrapped_inputs_are_filtered_per_branch_path() {
        let mut state = lane_state();
        let wrapped = WrappedSequence::routed(vec![(json!(1), "odd".into()), (json!(2), "even".into())], 1);
        state.seed("items", PoolValue::Wrapped(wrapped));

        let even = BranchPath::root().extended(1, "even");
        let resolution = state.get(&key("a.double"), &even, &IndexMap::new()).expect("resolve");
        assert_eq!(resolution.arguments["items"], json!([2]));
        assert!(!resolution.signal);

        let missing = BranchPath::root().extended(1, "other");
        let resolution = state.get(&key("a.double"), &missing, &IndexMap::new()).expect("resolve");
        assert_eq!(resolution.arguments["items"], json!([]));
        assert!(resolution.signal);
    }

    #[test]
    fn unset_lanes_count_as_no_work() {
        let mut state = lane_state();
        let lanes = vec![LaneRecord {
            data: None,
            tags: LaneTags::from([(1, "odd".to_string())]),
        }];
        state.seed("items", PoolValue::Wrapped(WrappedSequence::new(lanes)));

        let resolution = state
            .get(&key("a.triple"), &BranchPath::root().extended(1, "odd"), &IndexMap::new())
            .expect("resolve");
        assert!(resolution.signal);
    }

    #[test]
    fn empty_wrapped_sequences_signal_at_root() {
        let mut state = lane_state();
        state.seed("items", PoolValue::Wrapped(WrappedSequence::default()));
        let resolution = state.get(&key("a.route"), &BranchPath::root(), &IndexMap::new()).expect("resolve");
        assert!(resolution.signal);
    }

    #[test]
    fn memory_alias_reads_history() {
        let state = lane_state();
        let resolution = state.get(&key("a.history"), &BranchPath::root(), &IndexMap::new()).expect("resolve");
        assert_eq!(resolution.arguments["past"], json!([]));
        assert!(!resolution.signal);
    }

    #[test]
    fn unwritten_local_parameters_fail_at_run_time() {
        let state = lane_state();
        let overrides = IndexMap::from([("prefix".to_string(), SourceExpr::LocalRef("absent".into()))]);
        let error = state.get(&key("a.label"), &BranchPath::root(), &overrides).expect_err("absent local");
        assert!(matches!(
            error,
            EngineError::UnboundLocal { ref name, .. } if name == "absent"
        ));
    }
}
