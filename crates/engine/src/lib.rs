//! # Weft Engine
//!
//! The Weft Engine compiles declarative tool pipelines and executes them against
//! an external tool client. A pipeline is a tree of calls, bounded loops, and
//! branches whose arms each see only the list elements ("lanes") routed to them.
//!
//! ## Key Features
//!
//! - **Compilation**: Every variable reference is resolved before the first tool call
//! - **Lane-aware state**: Branch arms read and write only their own lanes; results merge back in order
//! - **Loop early exit**: A loop stops once an iteration had no work to do
//! - **Observability**: Lifecycle, token, and source events stream to an optional observer
//!
//! ## Usage
//!
//! ```rust
//! use weft_engine::{CompiledPipeline, ParameterStore, model::lower_document, parse_pipeline_file, load_tool_registry};
//!
//! let temp_dir = tempfile::tempdir()?;
//! let pipeline_path = temp_dir.path().join("pipeline.yaml");
//! let registry_path = temp_dir.path().join("servers.yaml");
//! std::fs::write(&pipeline_path, "pipeline:\n  - benchmark.get_data\n")?;
//! std::fs::write(&registry_path, "servers:\n  benchmark:\n    tools:\n      get_data:\n        output: [q_ls]\n")?;
//!
//! let document = parse_pipeline_file(&pipeline_path)?;
//! let registry = load_tool_registry(&registry_path)?;
//! let compiled = CompiledPipeline::compile(lower_document(&document)?, &registry, ParameterStore::new())?;
//! assert!(compiled.table().declares("q_ls"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`model`**: Lowers authored pipeline documents into the closed step tree
//! - **`params`**: Per-server parameter store with run-time overrides
//! - **`table`**: Builds the immutable variable table and rejects unresolved references
//! - **`state`**: Per-run variable pool, memory pool, and snapshot trail
//! - **`executor`**: Recursive step interpreter and the tool client trait
//! - **`runner`**: Compiles once, runs many; lifecycle events and cleanup hooks

use std::{fs, path::Path};

use anyhow::{Context, Result};
use weft_types::{PipelineDocument, ToolRegistry};

pub mod error;
pub mod executor;
pub mod model;
pub mod params;
pub mod runner;
pub mod state;
pub mod table;

pub use error::{CompileError, EngineError};
pub use executor::{Interpreter, RunContext, TokenSink, ToolClient, ToolDescriptor};
pub use params::ParameterStore;
pub use runner::{CompiledPipeline, RunOutcome, RunRequest, run_pipeline};
pub use state::{ExecutionState, Resolution};
pub use table::{VariableEntry, VariableTable};

/// Loads a pipeline document (YAML or JSON) from disk.
pub fn parse_pipeline_file(file_path: impl AsRef<Path>) -> Result<PipelineDocument> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read pipeline file: {}", file_path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse pipeline file: {}", file_path.display()))
}

/// Loads the tool and prompt declarations of every server from disk.
pub fn load_tool_registry(file_path: impl AsRef<Path>) -> Result<ToolRegistry> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read tool registry: {}", file_path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse tool registry: {}", file_path.display()))
}

/// Parses, lowers, and compiles a pipeline from its three source files.
pub fn compile_files(
    pipeline_path: impl AsRef<Path>,
    registry_path: impl AsRef<Path>,
    parameter_path: Option<&Path>,
) -> Result<CompiledPipeline> {
    let document = parse_pipeline_file(pipeline_path)?;
    let registry = load_tool_registry(registry_path)?;
    let parameters = match parameter_path {
        Some(path) => ParameterStore::load_file(path)?,
        None => ParameterStore::new(),
    };
    let definition = model::lower_document(&document)?;
    Ok(CompiledPipeline::compile(definition, &registry, parameters)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pipeline_file_with_servers_section() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pipeline_path = temp_dir.path().join("pipeline.yaml");

        let pipeline_content = r#"
servers:
  benchmark: servers/benchmark
  generation: servers/generation
pipeline:
  - benchmark.get_data
  - loop:
      times: 2
      steps:
        - generation.generate
"#;

        fs::write(&pipeline_path, pipeline_content).unwrap();

        let document = parse_pipeline_file(&pipeline_path).expect("parse pipeline");
        assert_eq!(document.servers.len(), 2);
        assert_eq!(document.pipeline.len(), 2);
    }

    #[test]
    fn test_load_errors_name_the_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let missing = temp_dir.path().join("missing.yaml");
        let error = load_tool_registry(&missing).expect_err("missing registry");
        assert!(error.to_string().contains("Failed to read tool registry"));

        let broken = temp_dir.path().join("broken.yaml");
        fs::write(&broken, "pipeline: 3\n").unwrap();
        let error = parse_pipeline_file(&broken).expect_err("pipeline must be a list");
        assert!(error.to_string().contains("Failed to parse pipeline file"));
    }

    #[test]
    fn test_compile_files_reports_compile_errors() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pipeline_path = temp_dir.path().join("pipeline.yaml");
        let registry_path = temp_dir.path().join("servers.yaml");
        let parameter_path = temp_dir.path().join("parameter.yaml");
        fs::write(&pipeline_path, "pipeline:\n  - retriever.search\n").unwrap();
        fs::write(
            &registry_path,
            "servers:\n  retriever:\n    tools:\n      search:\n        input: { top_k: $top_k }\n        output: [ret_psg]\n",
        )
        .unwrap();
        fs::write(&parameter_path, "retriever:\n  top_k: 5\n").unwrap();

        let compiled = compile_files(&pipeline_path, &registry_path, Some(&parameter_path)).expect("compile");
        assert_eq!(compiled.table().pool_variables().collect::<Vec<_>>(), vec!["ret_psg"]);

        let error = compile_files(&pipeline_path, &registry_path, None).expect_err("top_k unresolved");
        let engine_error = error.downcast_ref::<EngineError>().expect("engine error");
        assert!(matches!(engine_error, EngineError::Compile(CompileError::UnresolvedLocalVariable { .. })));
    }
}
