//! Run driver.
//!
//! [`CompiledPipeline`] pairs a lowered pipeline with its variable table so the
//! compile phase happens once. [`run_pipeline`] then executes it with a fresh
//! state store and run context, emitting lifecycle events to an optional
//! observer and invoking cleanup hooks on every exit path except compile errors.

use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use weft_types::{BranchPath, InvocationKey, PipelineDefinition, PipelineEvent, PipelineRunStatus, PoolValue, Snapshot, ToolRegistry};

use crate::{
    error::EngineError,
    executor::{Interpreter, RunContext, TokenSink, ToolClient},
    params::ParameterStore,
    state::ExecutionState,
    table::VariableTable,
};

/// A pipeline whose references have all been resolved.
#[derive(Debug, Clone)]
pub struct CompiledPipeline {
    definition: PipelineDefinition,
    table: Arc<VariableTable>,
    parameters: ParameterStore,
}

impl CompiledPipeline {
    /// Builds the variable table; any unresolved reference is reported here.
    pub fn compile(definition: PipelineDefinition, registry: &ToolRegistry, parameters: ParameterStore) -> Result<Self, EngineError> {
        let table = VariableTable::build(&definition, registry, &parameters)?;
        Ok(Self {
            definition,
            table: Arc::new(table),
            parameters,
        })
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn table(&self) -> &VariableTable {
        &self.table
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }
}

/// Per-run options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Merged over the compiled parameters for this run only.
    pub overrides: ParameterStore,
    /// Invoked with empty arguments after the run finishes, fails, or is canceled.
    pub cleanup: Vec<InvocationKey>,
    pub observer: Option<UnboundedSender<PipelineEvent>>,
    pub cancellation: CancellationToken,
}

/// Everything a successful run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// Response of the last executed call, if any call ran.
    pub result: Option<Value>,
    pub pool: IndexMap<String, PoolValue>,
    pub memory: IndexMap<String, Vec<Value>>,
    pub snapshots: Vec<Snapshot>,
}

impl RunOutcome {
    /// Persists the snapshot trail as a pretty-printed JSON array.
    pub fn write_snapshots(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let encoded = serde_json::to_string_pretty(&self.snapshots).context("Failed to encode snapshots")?;
        fs::write(path, encoded).with_context(|| format!("Failed to write snapshots: {}", path.display()))
    }
}

/// Executes a compiled pipeline to completion.
///
/// Overrides are merged into a run-local copy of the parameters; the compiled
/// pipeline is never mutated, so one `CompiledPipeline` can back concurrent runs.
pub async fn run_pipeline(
    pipeline: &CompiledPipeline,
    client: Arc<dyn ToolClient>,
    request: RunRequest,
) -> Result<RunOutcome, EngineError> {
    let parameters = pipeline.parameters.merged(&request.overrides);
    let context = RunContext::new(request.cancellation.clone(), request.observer.clone());
    context.emit(PipelineEvent::RunStarted { at: Utc::now() });
    info!(calls = pipeline.definition.calls().len(), "pipeline run started");

    let state = ExecutionState::new(Arc::clone(&pipeline.table), parameters);
    let mut interpreter = Interpreter::new(Arc::clone(&client), state, context);

    let result = drive(&mut interpreter, &pipeline.definition).await;

    if !matches!(result, Err(EngineError::Compile(_))) {
        run_cleanup(client.as_ref(), &request.cleanup).await;
    }

    let (status, error) = match &result {
        Ok(_) => (PipelineRunStatus::Succeeded, None),
        Err(error) if error.is_cancelled() => (PipelineRunStatus::Canceled, Some(error.to_string())),
        Err(error) => (PipelineRunStatus::Failed, Some(error.to_string())),
    };
    interpreter.context().emit(PipelineEvent::RunCompleted {
        status,
        finished_at: Utc::now(),
        error,
    });
    info!(?status, "pipeline run finished");

    let result = result?;
    let (pool, memory, snapshots) = interpreter.into_state().into_parts();
    Ok(RunOutcome {
        result,
        pool,
        memory,
        snapshots,
    })
}

async fn drive(interpreter: &mut Interpreter, definition: &PipelineDefinition) -> Result<Option<Value>, EngineError> {
    interpreter.preflight(definition).await?;
    interpreter.run_steps(&definition.steps, 0, &BranchPath::root()).await
}

async fn run_cleanup(client: &dyn ToolClient, hooks: &[InvocationKey]) {
    let arguments = JsonMap::new();
    for key in hooks {
        let tokens = TokenSink::detached(key.clone());
        match client.call_tool(key, &arguments, &tokens).await {
            Ok(_) => info!(step = %key, "cleanup hook finished"),
            Err(error) => warn!(step = %key, error = %error, "cleanup hook failed"),
        }
    }
}
