//! Tool client abstraction consumed by the interpreter.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use tokio::sync::mpsc::UnboundedSender;
use weft_types::{InvocationKey, PipelineEvent};

/// A tool advertised by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl ToolDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

/// Forwards partial generations of the current call to the run observer.
#[derive(Debug, Clone)]
pub struct TokenSink {
    step: InvocationKey,
    events: Option<UnboundedSender<PipelineEvent>>,
}

impl TokenSink {
    pub fn new(step: InvocationKey, events: Option<UnboundedSender<PipelineEvent>>) -> Self {
        Self { step, events }
    }

    /// A sink that drops everything.
    pub fn detached(step: InvocationKey) -> Self {
        Self { step, events: None }
    }

    pub fn step(&self) -> &InvocationKey {
        &self.step
    }

    pub fn emit(&self, partial: impl Into<String>) {
        if let Some(events) = &self.events {
            let _ = events.send(PipelineEvent::Token {
                step: self.step.clone(),
                partial: partial.into(),
            });
        }
    }
}

/// Connection to the servers that implement pipeline tools and prompts.
///
/// Implementations own transport, timeouts, and retries. Every error they
/// return is treated as fatal for the run and annotated with the invocation key.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Invokes a tool and returns its response object, keyed by output name.
    async fn call_tool(&self, key: &InvocationKey, arguments: &JsonMap<String, Value>, tokens: &TokenSink) -> Result<Value>;

    /// Renders a prompt into a list of chat messages.
    async fn get_prompt(&self, key: &InvocationKey, arguments: &JsonMap<String, Value>) -> Result<Vec<Value>>;

    /// Lists the tools a server exposes. Used once per run for preflight.
    async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>>;
}
