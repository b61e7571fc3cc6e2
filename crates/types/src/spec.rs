//! Tool specifications produced by the external build step.
//!
//! Each server publishes the inputs and outputs of its tools and prompts. Input
//! sources are written as plain YAML scalars: `$name` reads the server's
//! parameter store, any other string reads the global variable pool, and any
//! non-string value (or `{ literal: ... }`) is passed through unchanged.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::pipeline::InvocationKey;

/// Prefix marking a parameter-store (local) reference.
pub const LOCAL_PREFIX: char = '$';

/// Where a tool parameter reads its value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "JsonValue", into = "JsonValue")]
pub enum SourceExpr {
    Literal(JsonValue),
    LocalRef(String),
    GlobalRef(String),
}

impl From<JsonValue> for SourceExpr {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::String(text) => match text.strip_prefix(LOCAL_PREFIX) {
                Some(local) => SourceExpr::LocalRef(local.to_string()),
                None => SourceExpr::GlobalRef(text),
            },
            JsonValue::Object(mut object) if object.len() == 1 && object.contains_key("literal") => {
                SourceExpr::Literal(object.remove("literal").unwrap_or(JsonValue::Null))
            }
            other => SourceExpr::Literal(other),
        }
    }
}

impl From<SourceExpr> for JsonValue {
    fn from(expr: SourceExpr) -> Self {
        match expr {
            SourceExpr::LocalRef(name) => JsonValue::String(format!("{LOCAL_PREFIX}{name}")),
            SourceExpr::GlobalRef(name) => JsonValue::String(name),
            SourceExpr::Literal(value @ JsonValue::String(_)) => {
                let mut object = serde_json::Map::new();
                object.insert("literal".into(), value);
                JsonValue::Object(object)
            }
            SourceExpr::Literal(value) => value,
        }
    }
}

/// Destination of a declared output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "store", content = "name", rename_all = "snake_case")]
pub enum OutputTarget {
    /// Global variable pool.
    Global(String),
    /// The owning server's parameter store.
    Local(String),
}

impl OutputTarget {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(LOCAL_PREFIX) {
            Some(local) => OutputTarget::Local(local.to_string()),
            None => OutputTarget::Global(raw.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            OutputTarget::Global(name) | OutputTarget::Local(name) => name,
        }
    }

    /// Name under which the write is recorded in memory and snapshots.
    pub fn record_name(&self) -> String {
        match self {
            OutputTarget::Global(name) => name.clone(),
            OutputTarget::Local(name) => format!("{LOCAL_PREFIX}{name}"),
        }
    }
}

/// Declared inputs and outputs of one tool or prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(default)]
    pub input: IndexMap<String, SourceExpr>,
    #[serde(default)]
    pub output: Vec<String>,
}

/// Tools and prompts exposed by a single server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    #[serde(default)]
    pub tools: IndexMap<String, ToolSpec>,
    #[serde(default)]
    pub prompts: IndexMap<String, ToolSpec>,
}

/// Whether an invocation targets the tool or the prompt namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    Tool,
    Prompt,
}

/// Specs for every server a pipeline may call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolRegistry {
    #[serde(default)]
    pub servers: IndexMap<String, ServerSpec>,
}

impl ToolRegistry {
    /// Looks up a tool first, then a prompt of the same name.
    pub fn lookup(&self, key: &InvocationKey) -> Option<(InvocationKind, &ToolSpec)> {
        let server = self.servers.get(&key.server)?;
        server
            .tools
            .get(&key.tool)
            .map(|spec| (InvocationKind::Tool, spec))
            .or_else(|| server.prompts.get(&key.tool).map(|spec| (InvocationKind::Prompt, spec)))
    }

    pub fn has_server(&self, server: &str) -> bool {
        self.servers.contains_key(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_expressions_follow_prefix_rules() {
        assert_eq!(SourceExpr::from(json!("$top_k")), SourceExpr::LocalRef("top_k".into()));
        assert_eq!(SourceExpr::from(json!("q_ls")), SourceExpr::GlobalRef("q_ls".into()));
        assert_eq!(SourceExpr::from(json!(5)), SourceExpr::Literal(json!(5)));
        assert_eq!(SourceExpr::from(json!({"literal": "q_ls"})), SourceExpr::Literal(json!("q_ls")));
        assert_eq!(
            SourceExpr::from(json!({"mode": "dense"})),
            SourceExpr::Literal(json!({"mode": "dense"}))
        );
    }

    #[test]
    fn string_literals_keep_their_wrapper_when_encoded() {
        let encoded = JsonValue::from(SourceExpr::Literal(json!("plain")));
        assert_eq!(encoded, json!({"literal": "plain"}));
        assert_eq!(SourceExpr::from(encoded), SourceExpr::Literal(json!("plain")));
    }

    #[test]
    fn output_targets_split_local_and_global() {
        assert_eq!(OutputTarget::parse("$cache"), OutputTarget::Local("cache".into()));
        assert_eq!(OutputTarget::parse("ret_psg"), OutputTarget::Global("ret_psg".into()));
        assert_eq!(OutputTarget::Local("cache".into()).record_name(), "$cache");
    }

    #[test]
    fn registry_prefers_tools_over_prompts() {
        let yaml = r#"
servers:
  prompt:
    tools:
      qa:
        input: { q_ls: q_ls }
        output: [tool_out]
    prompts:
      qa:
        input: { q_ls: q_ls }
        output: [prompt_ls]
      summarize:
        input: { docs: ret_psg }
        output: [summary_prompt]
"#;
        let registry: ToolRegistry = serde_yaml::from_str(yaml).expect("decode registry");

        let (kind, spec) = registry.lookup(&"prompt.qa".parse().expect("key")).expect("qa present");
        assert_eq!(kind, InvocationKind::Tool);
        assert_eq!(spec.output, vec!["tool_out".to_string()]);

        let (kind, _) = registry.lookup(&"prompt.summarize".parse().expect("key")).expect("summarize present");
        assert_eq!(kind, InvocationKind::Prompt);
        assert!(registry.lookup(&"prompt.missing".parse().expect("key")).is_none());
    }
}
