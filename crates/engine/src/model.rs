//! # Pipeline Lowering
//!
//! Converts an authored [`PipelineDocument`] into the closed [`Step`] tree the
//! interpreter walks. Lowering is purely structural: invocation keys must parse,
//! loops must run at least once, and every branch needs a router ending in a
//! call plus at least one arm. Cross-references against tool specs and the
//! parameter store happen later in [`crate::table`].
//!
//! ## Usage
//!
//! ```rust
//! use weft_engine::model::lower_document;
//! use weft_types::{PipelineDocument, Step};
//!
//! let document: PipelineDocument = serde_yaml::from_str(r#"
//! pipeline:
//!   - benchmark.get_data
//!   - loop:
//!       times: 2
//!       steps:
//!         - generation.generate
//! "#)?;
//!
//! let definition = lower_document(&document)?;
//! assert!(matches!(definition.steps[1], Step::Loop(_)));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use indexmap::IndexMap;
use weft_types::{
    BranchStep, CallStep, InvocationKey, LoopStep, PipelineDefinition, PipelineDocument, RawBranch, RawCallOverrides, RawStep, Step,
};

use crate::error::CompileError;

/// Lowers every top-level step of the document.
pub fn lower_document(document: &PipelineDocument) -> Result<PipelineDefinition, CompileError> {
    let steps = lower_steps(&document.pipeline)?;
    Ok(PipelineDefinition { steps })
}

fn lower_steps(raw_steps: &[RawStep]) -> Result<Vec<Step>, CompileError> {
    raw_steps.iter().map(lower_step).collect()
}

fn lower_step(raw: &RawStep) -> Result<Step, CompileError> {
    match raw {
        RawStep::Call(name) => Ok(Step::Call(CallStep::new(parse_key(name)?))),
        RawStep::CallWithOverrides(entries) => lower_call_with_overrides(entries),
        RawStep::Loop { body } => {
            if body.times == 0 {
                return Err(CompileError::malformed("loop", "times must be at least 1"));
            }
            Ok(Step::Loop(LoopStep {
                times: body.times,
                body: lower_steps(&body.steps)?,
            }))
        }
        RawStep::Branch { branch } => lower_branch(branch),
    }
}

fn lower_call_with_overrides(entries: &IndexMap<String, RawCallOverrides>) -> Result<Step, CompileError> {
    let mut iter = entries.iter();
    let (Some((name, overrides)), None) = (iter.next(), iter.next()) else {
        let names: Vec<&str> = entries.keys().map(String::as_str).collect();
        return Err(CompileError::malformed(
            names.join(","),
            "a call with overrides must name exactly one tool",
        ));
    };

    let key = parse_key(name)?;
    Ok(Step::Call(CallStep {
        key,
        input_overrides: overrides.input.clone(),
        output_overrides: overrides.output.clone(),
        skeleton: overrides.skeleton.clone(),
    }))
}

fn lower_branch(branch: &RawBranch) -> Result<Step, CompileError> {
    let router = lower_steps(&branch.router)?;
    match router.last() {
        Some(Step::Call(_)) => {}
        Some(_) => return Err(CompileError::malformed("branch", "the last router step must be a tool call")),
        None => return Err(CompileError::malformed("branch", "router must contain at least one step")),
    }
    if branch.branches.is_empty() {
        return Err(CompileError::malformed("branch", "at least one arm is required"));
    }

    let mut arms = IndexMap::with_capacity(branch.branches.len());
    for (state, steps) in &branch.branches {
        arms.insert(state.clone(), lower_steps(steps)?);
    }
    Ok(Step::Branch(BranchStep { router, arms }))
}

fn parse_key(raw: &str) -> Result<InvocationKey, CompileError> {
    raw.parse::<InvocationKey>()
        .map_err(|error| CompileError::malformed(raw, error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lower_yaml(yaml: &str) -> Result<PipelineDefinition, CompileError> {
        let document: PipelineDocument = serde_yaml::from_str(yaml).expect("decode document");
        lower_document(&document)
    }

    #[test]
    fn lowers_nested_loops_and_branches() {
        let definition = lower_yaml(
            r#"
pipeline:
  - loop:
      times: 3
      steps:
        - branch:
            router:
              - retriever.search
              - router.check
            branches:
              continue:
                - generation.generate:
                    output:
                      ans_ls: pred_ls
              stop: []
"#,
        )
        .expect("lower pipeline");

        let Step::Loop(looped) = &definition.steps[0] else {
            panic!("expected loop");
        };
        assert_eq!(looped.times, 3);
        let Step::Branch(branch) = &looped.body[0] else {
            panic!("expected branch");
        };
        assert_eq!(branch.router.len(), 2);
        assert_eq!(branch.arms.keys().collect::<Vec<_>>(), vec!["continue", "stop"]);
        let Step::Call(call) = &branch.arms["continue"][0] else {
            panic!("expected call");
        };
        assert_eq!(call.output_overrides["ans_ls"], "pred_ls");
    }

    #[test]
    fn rejects_zero_iteration_loops() {
        let error = lower_yaml("pipeline:\n  - loop:\n      times: 0\n      steps: []\n").expect_err("zero loop");
        assert!(matches!(error, CompileError::MalformedStep { ref step, .. } if step == "loop"));
    }

    #[test]
    fn rejects_routers_that_do_not_end_in_a_call() {
        let error = lower_yaml(
            r#"
pipeline:
  - branch:
      router:
        - loop:
            times: 1
            steps: [router.check]
      branches:
        done: []
"#,
        )
        .expect_err("router must end with call");
        assert!(error.to_string().contains("last router step"));
    }

    #[test]
    fn rejects_unqualified_tool_names() {
        let error = lower_yaml("pipeline:\n  - generate\n").expect_err("missing server");
        assert!(matches!(error, CompileError::MalformedStep { ref step, .. } if step == "generate"));
    }
}
