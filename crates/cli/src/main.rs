use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use weft_engine::{CompiledPipeline, compile_files};

/// Compile and inspect Weft pipelines.
#[derive(Debug, Parser)]
#[command(name = "weft", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile a pipeline and report the first unresolved reference.
    Check(PipelineArgs),
    /// Print the compiled variable table as JSON.
    Table(PipelineArgs),
}

#[derive(Debug, Args)]
struct PipelineArgs {
    /// Pipeline file (YAML or JSON).
    #[arg(long, short = 'p')]
    pipeline: PathBuf,
    /// Tool and prompt declarations for every server.
    #[arg(long, short = 'r')]
    registry: PathBuf,
    /// Per-server parameter file.
    #[arg(long)]
    params: Option<PathBuf>,
}

impl PipelineArgs {
    fn compile(&self) -> Result<CompiledPipeline> {
        compile_files(&self.pipeline, &self.registry, self.params.as_deref())
            .with_context(|| format!("pipeline {} does not compile", self.pipeline.display()))
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Check(args) => {
            let compiled = args.compile()?;
            info!(pipeline = %args.pipeline.display(), "pipeline compiled");
            println!(
                "ok: {} tools, {} pool variables",
                compiled.table().entries().count(),
                compiled.table().pool_variables().count()
            );
        }
        Command::Table(args) => {
            let compiled = args.compile()?;
            println!("{}", serde_json::to_string_pretty(compiled.table())?);
        }
    }
    Ok(())
}

/// `RUST_LOG` directives, defaulting to `info`. The filter alone decides verbosity.
fn log_filter(directives: Option<String>) -> EnvFilter {
    EnvFilter::new(directives.unwrap_or_else(|| "info".into()))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok()))
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_table_arguments() {
        let cli = Cli::try_parse_from(["weft", "table", "-p", "pipeline.yaml", "-r", "servers.yaml", "--params", "parameter.yaml"])
            .expect("parse arguments");
        let Command::Table(args) = cli.command else {
            panic!("expected the table command");
        };
        assert_eq!(args.pipeline, PathBuf::from("pipeline.yaml"));
        assert_eq!(args.params, Some(PathBuf::from("parameter.yaml")));
    }

    #[test]
    fn log_filter_keeps_debug_directives() {
        assert!(log_filter(Some("weft_engine=debug".into())).to_string().contains("weft_engine=debug"));
        assert!(log_filter(None).to_string().contains("info"));
    }
}
