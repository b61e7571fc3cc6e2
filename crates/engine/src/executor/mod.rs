//! Step interpreter.
//!
//! Walks a compiled pipeline by recursive descent, carrying the current nesting
//! depth and branch path. Calls are awaited one at a time; the tool client is
//! the only suspension point and every await races the run's cancellation token.
//!
//! - `client::ToolClient` abstracts the servers that implement tools and prompts
//! - `summary` builds the human-readable step summaries and source lists sent to observers
//! - Loop termination flags live in the per-run [`RunContext`], never in globals

use std::{sync::Arc, time::Instant};

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use weft_types::{
    BranchPath, BranchStep, CallStep, InvocationKey, InvocationKind, LoopStep, PipelineDefinition, PipelineEvent, Step,
    spec::LOCAL_PREFIX,
};

use crate::{
    error::{CompileError, EngineError},
    state::{ExecutionState, Resolution, StepWrite, WriteMode, WriteOutcome},
};

pub mod client;
pub mod summary;

pub use client::{TokenSink, ToolClient, ToolDescriptor};
use summary::{SourceCatalog, is_source_tool, summarize_response};

/// Mutable bookkeeping owned by exactly one run.
#[derive(Debug)]
pub struct RunContext {
    /// One flag per active loop, innermost last. Cleared by any call that does work.
    loop_flags: Vec<bool>,
    cancellation: CancellationToken,
    events: Option<UnboundedSender<PipelineEvent>>,
    sources: SourceCatalog,
    preflight_done: bool,
}

impl RunContext {
    pub fn new(cancellation: CancellationToken, events: Option<UnboundedSender<PipelineEvent>>) -> Self {
        Self {
            loop_flags: Vec::new(),
            cancellation,
            events,
            sources: SourceCatalog::default(),
            preflight_done: false,
        }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Executes steps against one [`ExecutionState`].
pub struct Interpreter {
    client: Arc<dyn ToolClient>,
    state: ExecutionState,
    context: RunContext,
}

impl Interpreter {
    pub fn new(client: Arc<dyn ToolClient>, state: ExecutionState, context: RunContext) -> Self {
        Self { client, state, context }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn into_state(self) -> ExecutionState {
        self.state
    }

    /// Checks that every tool the pipeline calls is advertised by its server.
    ///
    /// Runs at most once per run; prompts are not checked.
    pub async fn preflight(&mut self, definition: &PipelineDefinition) -> Result<(), EngineError> {
        if self.context.preflight_done {
            return Ok(());
        }

        let mut by_server: IndexMap<&str, IndexSet<&InvocationKey>> = IndexMap::new();
        for call in definition.calls() {
            let is_tool = self
                .state
                .table()
                .entry(&call.key)
                .is_some_and(|entry| entry.kind == InvocationKind::Tool);
            if is_tool {
                by_server.entry(call.key.server.as_str()).or_default().insert(&call.key);
            }
        }

        for (server, keys) in by_server {
            let Some(first) = keys.first() else {
                continue;
            };
            let listed = tokio::select! {
                biased;
                _ = self.context.cancellation.cancelled() => return Err(EngineError::Cancelled),
                listed = self.client.list_tools(server) => listed.map_err(|error| EngineError::tool_invocation(first, error))?,
            };
            if let Some(missing) = keys.iter().find(|key| !listed.iter().any(|tool| tool.name == key.tool)) {
                return Err(EngineError::UnknownTool {
                    step: (*missing).clone(),
                });
            }
            debug!(server = %server, tools = listed.len(), "preflight passed");
        }

        self.context.preflight_done = true;
        Ok(())
    }

    /// Runs `steps` in order and returns the last result any of them produced.
    pub fn run_steps<'a>(
        &'a mut self,
        steps: &'a [Step],
        depth: usize,
        path: &'a BranchPath,
    ) -> BoxFuture<'a, Result<Option<Value>, EngineError>> {
        async move {
            let mut last = None;
            for step in steps {
                if self.context.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                let result = match step {
                    Step::Call(call) => self.run_call(call, depth, path, WriteMode::Plain).await?.0,
                    Step::Loop(looped) => self.run_loop(looped, depth, path).await?,
                    Step::Branch(branch) => self.run_branch(branch, depth, path).await?,
                };
                if result.is_some() {
                    last = result;
                }
            }
            Ok(last)
        }
        .boxed()
    }

    async fn run_call(
        &mut self,
        call: &CallStep,
        depth: usize,
        path: &BranchPath,
        mode: WriteMode,
    ) -> Result<(Option<Value>, WriteOutcome), EngineError> {
        let resolution = self.state.get(&call.key, path, &call.input_overrides)?;
        if resolution.signal {
            debug!(step = %call.key, path = %path, "no live lanes, skipping call");
            return Ok((None, WriteOutcome::default()));
        }

        self.context.loop_flags.iter_mut().for_each(|flag| *flag = false);
        self.context.emit(PipelineEvent::StepStarted {
            step: call.key.clone(),
            depth,
            started_at: Utc::now(),
        });
        info!(step = %call.key, depth, path = %path, "executing call");

        let started_at = Instant::now();
        let response = self.invoke(&resolution).await?;
        let outcome = self.state.put(StepWrite {
            key: &call.key,
            path,
            response: &response,
            output_overrides: &call.output_overrides,
            skeleton: call.skeleton.as_deref(),
            mode,
        })?;
        let duration_ms = started_at.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

        self.context.emit(PipelineEvent::StepEnded {
            step: call.key.clone(),
            summary: summarize_response(&response),
            duration_ms,
        });
        if is_source_tool(&call.key) {
            let sources = self.context.sources.collect(&response);
            if !sources.is_empty() {
                self.context.emit(PipelineEvent::Sources {
                    step: call.key.clone(),
                    sources,
                });
            }
        }

        Ok((Some(response), outcome))
    }

    async fn invoke(&self, resolution: &Resolution) -> Result<Value, EngineError> {
        let key = &resolution.key;
        let request = async {
            match resolution.kind {
                InvocationKind::Tool => {
                    let tokens = TokenSink::new(key.clone(), self.context.events.clone());
                    self.client.call_tool(key, &resolution.arguments, &tokens).await
                }
                InvocationKind::Prompt => {
                    let output = prompt_output(&self.state, key)?;
                    let messages = self.client.get_prompt(key, &resolution.arguments).await?;
                    let mut response = serde_json::Map::new();
                    response.insert(output, Value::Array(messages));
                    Ok(Value::Object(response))
                }
            }
        };

        tokio::select! {
            biased;
            _ = self.context.cancellation.cancelled() => Err(EngineError::Cancelled),
            response = request => response.map_err(|error| EngineError::tool_invocation(key, error)),
        }
    }

    async fn run_loop(&mut self, looped: &LoopStep, depth: usize, path: &BranchPath) -> Result<Option<Value>, EngineError> {
        self.context.loop_flags.push(true);
        let result = self.loop_iterations(looped, depth, path).await;
        self.context.loop_flags.pop();
        result
    }

    async fn loop_iterations(&mut self, looped: &LoopStep, depth: usize, path: &BranchPath) -> Result<Option<Value>, EngineError> {
        let mut last = None;
        for iteration in 1..=looped.times {
            if let Some(flag) = self.context.loop_flags.last_mut() {
                *flag = true;
            }
            if let Some(result) = self.run_steps(&looped.body, depth + 1, path).await? {
                last = Some(result);
            }
            if self.context.loop_flags.last().copied().unwrap_or(false) {
                info!(iteration, times = looped.times, depth, "loop body had no work, exiting early");
                break;
            }
        }
        Ok(last)
    }

    async fn run_branch(&mut self, branch: &BranchStep, depth: usize, path: &BranchPath) -> Result<Option<Value>, EngineError> {
        let Some((Step::Call(router), setup)) = branch.router.split_last() else {
            return Err(CompileError::malformed("branch", "router must end with a call").into());
        };

        self.run_steps(setup, depth, path).await?;
        if self.context.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let (_, outcome) = self.run_call(router, depth, path, WriteMode::Router { depth }).await?;

        let mut last = None;
        for state in outcome.states {
            let Some(arm) = branch.arms.get(&state) else {
                return Err(EngineError::malformed_output(
                    &router.key,
                    "state",
                    format!("router selected '{state}' but no such branch exists"),
                ));
            };
            let arm_path = path.extended(depth + 1, state);
            info!(router = %router.key, path = %arm_path, "entering branch arm");
            if let Some(result) = self.run_steps(arm, depth + 1, &arm_path).await? {
                last = Some(result);
            }
        }
        Ok(last)
    }
}

/// Response key a prompt's messages are stored under.
fn prompt_output(state: &ExecutionState, key: &InvocationKey) -> anyhow::Result<String> {
    state
        .table()
        .entry(key)
        .and_then(|entry| entry.output.first())
        .map(|name| name.trim_start_matches(LOCAL_PREFIX).to_string())
        .ok_or_else(|| CompileError::malformed(key, "prompts must declare exactly one output").into())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use serde_json::{Map as JsonMap, json};
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::state::fixtures::lane_state;

    /// Doubles or triples numbers, routes by parity, labels and counts.
    #[derive(Default)]
    struct LaneClient {
        calls: Mutex<Vec<String>>,
    }

    impl LaneClient {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }
    }

    fn numbers(arguments: &JsonMap<String, Value>) -> Vec<i64> {
        arguments
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default()
    }

    #[async_trait]
    impl ToolClient for LaneClient {
        async fn call_tool(&self, key: &InvocationKey, arguments: &JsonMap<String, Value>, _tokens: &TokenSink) -> Result<Value> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(key.to_string());
            }
            let items = numbers(arguments);
            Ok(match key.tool.as_str() {
                "init" => json!({"items": [1, 2, 3]}),
                "route" => {
                    let lanes: Vec<Value> = items
                        .iter()
                        .map(|n| json!({"data": n, "state": if n % 2 == 0 { "even" } else { "odd" }}))
                        .collect();
                    json!({ "items": lanes })
                }
                "double" => json!({"items": items.iter().map(|n| n * 2).collect::<Vec<_>>()}),
                "triple" => json!({"items": items.iter().map(|n| n * 3).collect::<Vec<_>>()}),
                "label" => json!({"labels": items.iter().map(|n| format!("n{n}")).collect::<Vec<_>>()}),
                "history" => json!({"count": arguments.get("past").and_then(Value::as_array).map(Vec::len)}),
                other => return Err(anyhow!("unexpected tool {other}")),
            })
        }

        async fn get_prompt(&self, _key: &InvocationKey, _arguments: &JsonMap<String, Value>) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }

        async fn list_tools(&self, _server: &str) -> Result<Vec<ToolDescriptor>> {
            Ok(["init", "route", "double", "triple", "label"].map(ToolDescriptor::named).to_vec())
        }
    }

    fn definition() -> PipelineDefinition {
        let document = serde_yaml::from_str(crate::state::fixtures::LANE_PIPELINE).expect("decode pipeline");
        crate::model::lower_document(&document).expect("lower pipeline")
    }

    #[tokio::test]
    async fn odd_even_branches_merge_back_into_items() {
        let client = Arc::new(LaneClient::default());
        let (sender, mut receiver) = unbounded_channel();
        let mut interpreter = Interpreter::new(
            client.clone(),
            lane_state(),
            RunContext::new(CancellationToken::new(), Some(sender)),
        );

        let result = interpreter
            .run_steps(&definition().steps, 0, &BranchPath::root())
            .await
            .expect("run pipeline");

        assert_eq!(result, Some(json!({"count": 4})));
        let state = interpreter.state();
        assert_eq!(state.value("items").map(|value| value.to_json()), Some(json!([3, 4, 9])));
        let tags: Vec<_> = state
            .value("items")
            .and_then(|value| value.as_wrapped())
            .map(|wrapped| wrapped.lanes().iter().map(|lane| lane.tags[&1].clone()).collect())
            .unwrap_or_default();
        assert_eq!(tags, vec!["odd", "even", "odd"]);
        assert_eq!(state.value("labels").map(|value| value.to_json()), Some(json!([null, "n4", null])));
        assert_eq!(
            client.calls(),
            vec!["a.init", "a.route", "a.triple", "a.double", "a.label", "a.history"]
        );

        let mut started = 0;
        while let Ok(event) = receiver.try_recv() {
            if matches!(event, PipelineEvent::StepStarted { .. }) {
                started += 1;
            }
        }
        assert_eq!(started, 6);
    }

    #[tokio::test]
    async fn preflight_rejects_missing_tools_once() {
        let client = Arc::new(LaneClient::default());
        let mut interpreter = Interpreter::new(client, lane_state(), RunContext::new(CancellationToken::new(), None));

        let error = interpreter.preflight(&definition()).await.expect_err("history is not listed");
        assert!(matches!(error, EngineError::UnknownTool { ref step } if step.tool == "history"));
        assert!(!interpreter.context.preflight_done);
    }

    #[tokio::test]
    async fn cancelled_runs_stop_before_the_next_step() {
        let token = CancellationToken::new();
        token.cancel();
        let client = Arc::new(LaneClient::default());
        let mut interpreter = Interpreter::new(client.clone(), lane_state(), RunContext::new(token, None));

        let error = interpreter
            .run_steps(&definition().steps, 0, &BranchPath::root())
            .await
            .expect_err("cancelled");
        assert!(error.is_cancelled());
        assert!(client.calls().is_empty());
    }
}
