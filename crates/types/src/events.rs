//! Observer events and the snapshot audit trail emitted by a pipeline run.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::pipeline::InvocationKey;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRunStatus {
    Succeeded,
    Failed,
    Canceled,
}

/// A retrieved passage surfaced to the observer, numbered stably within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: usize,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
}

/// Advisory lifecycle events. Observers never influence control flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        at: DateTime<Utc>,
    },
    StepStarted {
        step: InvocationKey,
        depth: usize,
        started_at: DateTime<Utc>,
    },
    StepEnded {
        step: InvocationKey,
        summary: String,
        duration_ms: u64,
    },
    /// Partial output streamed by a generating tool.
    Token {
        step: InvocationKey,
        partial: String,
    },
    Sources {
        step: InvocationKey,
        sources: Vec<SourceRecord>,
    },
    RunCompleted {
        status: PipelineRunStatus,
        finished_at: DateTime<Utc>,
        error: Option<String>,
    },
}

/// Values written by one executed call, keyed by variable name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub step: InvocationKey,
    pub memory_delta: IndexMap<String, JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_type_tags() {
        let event = PipelineEvent::Token {
            step: InvocationKey::new("generation", "generate"),
            partial: "Par".into(),
        };
        let encoded = serde_json::to_value(&event).expect("encode event");
        assert_eq!(encoded, json!({"type": "token", "step": "generation.generate", "partial": "Par"}));
    }

    #[test]
    fn snapshots_keep_delta_order() {
        let mut delta = IndexMap::new();
        delta.insert("q_ls".to_string(), json!(["a"]));
        delta.insert("gt_ls".to_string(), json!(["b"]));
        let snapshot = Snapshot {
            step: InvocationKey::new("benchmark", "get_data"),
            memory_delta: delta,
        };

        let encoded = serde_json::to_string(&snapshot).expect("encode snapshot");
        assert_eq!(encoded, r#"{"step":"benchmark.get_data","memory_delta":{"q_ls":["a"],"gt_ls":["b"]}}"#);
        let decoded: Snapshot = serde_json::from_str(&encoded).expect("decode snapshot");
        assert_eq!(decoded, snapshot);
    }
}
