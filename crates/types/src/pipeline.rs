//! Pipeline documents and the compiled step tree.
//!
//! Authors write pipelines as YAML documents whose steps are either a bare
//! `server.tool` string or a single-key map (`loop`, `branch`, or a call with
//! overrides). [`PipelineDocument`] mirrors that authoring shape verbatim. The
//! engine lowers it once into [`PipelineDefinition`], a closed [`Step`] tree
//! that is never re-interpreted at run time.

use std::{fmt, str::FromStr};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::spec::SourceExpr;

/// Identifies a tool or prompt exposed by a server, rendered as `server.tool`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InvocationKey {
    /// Server namespace the tool belongs to.
    pub server: String,
    /// Tool or prompt name within the server.
    pub tool: String,
}

/// Raised when a `server.tool` identifier cannot be split into its parts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid invocation '{raw}': expected 'server.tool'")]
pub struct InvocationKeyError {
    pub raw: String,
}

impl InvocationKey {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
        }
    }
}

impl FromStr for InvocationKey {
    type Err = InvocationKeyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        match trimmed.split_once('.') {
            Some((server, tool)) if !server.is_empty() && !tool.is_empty() => Ok(Self::new(server, tool)),
            _ => Err(InvocationKeyError { raw: raw.to_string() }),
        }
    }
}

impl TryFrom<String> for InvocationKey {
    type Error = InvocationKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InvocationKey> for String {
    fn from(key: InvocationKey) -> Self {
        key.to_string()
    }
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.server, self.tool)
    }
}

/// Pipeline file as authored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineDocument {
    /// Server declarations keyed by namespace. Values are informational (paths or metadata).
    #[serde(default)]
    pub servers: IndexMap<String, JsonValue>,
    /// Ordered top-level steps.
    #[serde(default)]
    pub pipeline: Vec<RawStep>,
}

/// One authored step before lowering.
///
/// Variant order matters for untagged decoding: the structural `loop` and
/// `branch` shapes are tried before the generic single-key call map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawStep {
    /// `server.tool`
    Call(String),
    /// `{ loop: { times, steps } }`
    Loop {
        #[serde(rename = "loop")]
        body: RawLoop,
    },
    /// `{ branch: { router, branches } }`
    Branch { branch: RawBranch },
    /// `{ server.tool: { input, output, skeleton } }`
    CallWithOverrides(IndexMap<String, RawCallOverrides>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawLoop {
    pub times: usize,
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawBranch {
    #[serde(default)]
    pub router: Vec<RawStep>,
    #[serde(default)]
    pub branches: IndexMap<String, Vec<RawStep>>,
}

/// Per-call-site overrides layered over the tool's declared spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RawCallOverrides {
    /// Tool parameter → source expression.
    #[serde(default)]
    pub input: IndexMap<String, SourceExpr>,
    /// Declared output name → pool (or `$local`) name it is written to.
    #[serde(default)]
    pub output: IndexMap<String, String>,
    /// Pool variable used as the lane skeleton when padding a partial result.
    #[serde(default)]
    pub skeleton: Option<String>,
}

/// Compiled pipeline: an ordered list of steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineDefinition {
    pub steps: Vec<Step>,
}

impl PipelineDefinition {
    /// Visits every call in authoring order, descending into loops, routers, and arms.
    pub fn calls(&self) -> Vec<&CallStep> {
        let mut calls = Vec::new();
        collect_calls(&self.steps, &mut calls);
        calls
    }
}

fn collect_calls<'a>(steps: &'a [Step], calls: &mut Vec<&'a CallStep>) {
    for step in steps {
        match step {
            Step::Call(call) => calls.push(call),
            Step::Loop(looped) => collect_calls(&looped.body, calls),
            Step::Branch(branch) => {
                collect_calls(&branch.router, calls);
                for arm in branch.arms.values() {
                    collect_calls(arm, calls);
                }
            }
        }
    }
}

/// Closed step variant evaluated by the interpreter.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Call(CallStep),
    Loop(LoopStep),
    Branch(BranchStep),
}

/// Invocation of a single tool or prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStep {
    pub key: InvocationKey,
    pub input_overrides: IndexMap<String, SourceExpr>,
    pub output_overrides: IndexMap<String, String>,
    /// Explicit skeleton variable; when `None` the first matching wrapped variable is used.
    pub skeleton: Option<String>,
}

impl CallStep {
    pub fn new(key: InvocationKey) -> Self {
        Self {
            key,
            input_overrides: IndexMap::new(),
            output_overrides: IndexMap::new(),
            skeleton: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopStep {
    pub times: usize,
    pub body: Vec<Step>,
}

/// Router steps followed by per-state arms. The last router step is the routing call.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchStep {
    pub router: Vec<Step>,
    pub arms: IndexMap<String, Vec<Step>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_invocation_keys() {
        let key: InvocationKey = "retriever.search".parse().expect("parse key");
        assert_eq!(key.server, "retriever");
        assert_eq!(key.tool, "search");
        assert_eq!(key.to_string(), "retriever.search");

        let nested: InvocationKey = "prompt.qa.boxed".parse().expect("parse dotted tool");
        assert_eq!(nested.server, "prompt");
        assert_eq!(nested.tool, "qa.boxed");

        assert!("retriever".parse::<InvocationKey>().is_err());
        assert!(".search".parse::<InvocationKey>().is_err());
    }

    #[test]
    fn decodes_all_step_shapes() {
        let yaml = r#"
servers:
  gen: servers/generation
pipeline:
  - data.load
  - loop:
      times: 2
      steps:
        - gen.generate
  - branch:
      router:
        - router.check
      branches:
        retry:
          - gen.generate
        stop: []
  - gen.generate:
      input:
        prompt_ls: q_ls
      output:
        ans_ls: pred_ls
"#;
        let document: PipelineDocument = serde_yaml::from_str(yaml).expect("decode document");
        assert_eq!(document.pipeline.len(), 4);
        assert!(matches!(&document.pipeline[0], RawStep::Call(name) if name == "data.load"));
        assert!(matches!(&document.pipeline[1], RawStep::Loop { body } if body.times == 2));
        assert!(matches!(&document.pipeline[2], RawStep::Branch { branch } if branch.branches.len() == 2));
        let RawStep::CallWithOverrides(call) = &document.pipeline[3] else {
            panic!("expected call with overrides");
        };
        let overrides = &call["gen.generate"];
        assert_eq!(overrides.output["ans_ls"], "pred_ls");
        assert_eq!(overrides.input["prompt_ls"], SourceExpr::GlobalRef("q_ls".into()));
    }

    #[test]
    fn collects_calls_in_authoring_order() {
        let call = |raw: &str| Step::Call(CallStep::new(raw.parse().expect("key")));
        let definition = PipelineDefinition {
            steps: vec![
                call("a.init"),
                Step::Loop(LoopStep {
                    times: 2,
                    body: vec![call("a.poll")],
                }),
                Step::Branch(BranchStep {
                    router: vec![call("a.route")],
                    arms: IndexMap::from([("left".to_string(), vec![call("a.left")])]),
                }),
            ],
        };

        let names: Vec<String> = definition.calls().iter().map(|call| call.key.to_string()).collect();
        assert_eq!(names, vec!["a.init", "a.poll", "a.route", "a.left"]);
    }
}
