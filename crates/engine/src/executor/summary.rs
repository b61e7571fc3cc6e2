//! Human-readable step summaries and source extraction for observer events.

use indexmap::IndexMap;
use serde_json::Value;
use weft_types::{InvocationKey, SourceRecord};

const SOURCE_TOOL_HINTS: [&str; 4] = ["retriev", "rerank", "search", "cite"];
const CONTENT_FIELDS: [&str; 3] = ["contents", "content", "text"];

/// Short description of what a call produced, e.g. `ret_psg: 2 items, count: 7`.
pub fn summarize_response(response: &Value) -> String {
    let Some(object) = response.as_object() else {
        return describe(response);
    };
    if object.is_empty() {
        return "no outputs".to_string();
    }
    object
        .iter()
        .map(|(name, value)| format!("{name}: {}", describe(value)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe(value: &Value) -> String {
    match value {
        Value::Array(items) if items.len() == 1 => "1 item".to_string(),
        Value::Array(items) => format!("{} items", items.len()),
        Value::Object(fields) => format!("object with {} fields", fields.len()),
        Value::String(text) if text.chars().count() > 40 => {
            let preview: String = text.chars().take(40).collect();
            format!("\"{preview}…\"")
        }
        other => other.to_string(),
    }
}

pub fn is_source_tool(key: &InvocationKey) -> bool {
    let tool = key.tool.to_ascii_lowercase();
    SOURCE_TOOL_HINTS.iter().any(|hint| tool.contains(hint))
}

/// Run-wide passage numbering; the same passage keeps its id across steps.
#[derive(Debug, Default)]
pub struct SourceCatalog {
    ids: IndexMap<String, usize>,
}

impl SourceCatalog {
    /// Collects the distinct passages found in `response`, numbering unseen ones.
    pub fn collect(&mut self, response: &Value) -> Vec<SourceRecord> {
        let mut found: IndexMap<String, Option<String>> = IndexMap::new();
        if let Some(object) = response.as_object() {
            for value in object.values() {
                gather_passages(value, &mut found);
            }
        }

        found
            .into_iter()
            .map(|(content, title)| {
                let next = self.ids.len() + 1;
                let id = *self.ids.entry(content.clone()).or_insert(next);
                SourceRecord { id, title, content }
            })
            .collect()
    }
}

fn gather_passages(value: &Value, found: &mut IndexMap<String, Option<String>>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| gather_passages(item, found)),
        Value::String(text) if !text.trim().is_empty() => {
            found.entry(text.clone()).or_insert(None);
        }
        Value::Object(fields) => {
            let content = CONTENT_FIELDS
                .iter()
                .find_map(|field| fields.get(*field).and_then(Value::as_str));
            if let Some(content) = content {
                let title = fields.get("title").and_then(Value::as_str).map(str::to_string);
                let slot = found.entry(content.to_string()).or_insert(None);
                if slot.is_none() {
                    *slot = title;
                }
            }
        }
        _ => {}
    }
}
