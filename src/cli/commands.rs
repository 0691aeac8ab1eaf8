//! CLI command definitions for agent-swarm.
//!
//! The binary works on pipeline definition files and engine configuration;
//! running a pipeline needs an executor and happens through the library.

use crate::config::EngineConfig;
use crate::definition::PipelineDefinition;
use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Agent-swarm orchestration engine.
#[derive(Parser)]
#[command(name = "agent-swarm")]
#[command(about = "Validate agent-swarm pipeline definitions and inspect engine configuration")]
#[command(version)]
#[command(
    long_about = "agent-swarm runs pipelines of AI-agent stages (transform, gate, synthesis) over batches of items under a global concurrency bound.\n\nExample usage:\n  agent-swarm validate pipeline.yaml\n  SWARM_CONCURRENCY=8 agent-swarm config --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Load a YAML pipeline definition and check it without running it.
    #[command(alias = "check")]
    Validate(ValidateArgs),

    /// Print the engine configuration resolved from SWARM_* variables.
    Config(ConfigArgs),
}

/// Arguments for the validate command.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline definition file.
    pub path: PathBuf,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the config command.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct ValidateOutput {
    path: String,
    name: Option<String>,
    stages: Vec<StageSummary>,
}

#[derive(Debug, Serialize)]
struct StageSummary {
    index: usize,
    kind: String,
    name: Option<String>,
    summary: String,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Validate(args) => run_validate_command(args),
        Commands::Config(args) => run_config_command(args),
    }
}

fn run_validate_command(args: ValidateArgs) -> anyhow::Result<()> {
    let definition = PipelineDefinition::from_path(&args.path)
        .with_context(|| format!("Failed to load pipeline definition {}", args.path.display()))?;
    let name = definition.name.clone();
    let pipeline = definition
        .into_pipeline()
        .with_context(|| format!("Invalid pipeline definition {}", args.path.display()))?;

    info!(path = %args.path.display(), stages = pipeline.len(), "Pipeline definition is valid");

    if args.json {
        let output = ValidateOutput {
            path: args.path.display().to_string(),
            name,
            stages: pipeline
                .stages()
                .iter()
                .enumerate()
                .map(|(index, stage)| StageSummary {
                    index,
                    kind: stage.kind().to_string(),
                    name: stage.name().map(str::to_string),
                    summary: stage.summary(),
                })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "✓ {} is valid ({} stage(s))",
        name.as_deref().unwrap_or("pipeline"),
        pipeline.len()
    );
    for line in pipeline.describe() {
        println!("  {line}");
    }
    Ok(())
}

fn run_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("Failed to read engine configuration")?;
    let summary = config.summary();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Concurrency:     {}", summary.concurrency);
    println!("Max attempts:    {}", summary.retry.max_attempts);
    println!("Backoff:         {}ms x{}", summary.retry.backoff_ms, summary.retry.backoff_multiplier);
    match summary.timeout_ms {
        Some(ms) => println!("Default timeout: {ms}ms"),
        None => println!("Default timeout: none"),
    }
    if let Some(tag) = &summary.tag {
        println!("Tag:             {tag}");
    }
    Ok(())
}
