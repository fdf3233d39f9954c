//! Pipeworks CLI
//!
//! Run JSON-lines pipelines described in a configuration file.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pipeworks::{build_runtime, run_pipeline, Config, PipelineStats};

#[derive(Parser)]
#[command(name = "pipeworks")]
#[command(about = "Run concurrent JSON-lines pipelines", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pipeline.yaml", global = true)]
    config: PathBuf,

    /// Override the worker count of every stage
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "pipeline.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(cli.config, cli.concurrency)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config, cli.concurrency)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(config_path: &PathBuf, concurrency: Option<usize>) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;

    // Apply overrides
    if let Some(c) = concurrency {
        config.set_concurrency(c);
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, concurrency: Option<usize>) -> Result<()> {
    let config = load_config(&config_path, concurrency)?;

    let runtime = build_runtime(config.worker_threads)?;
    let stats = runtime.block_on(async { run_pipeline(config).await })?;

    print_summary(&stats);
    if stats.total_errors() > 0 {
        tracing::warn!("{} items failed; see the log for details", stats.total_errors());
    }

    Ok(())
}

fn print_summary(stats: &PipelineStats) {
    println!("\n=== Pipeline Summary ===");
    println!("Pipeline: {}", stats.name);
    println!("Total time: {:.1}s", stats.elapsed.as_secs_f64());
    for stage in &stats.stages {
        println!("{:<24} {:>10} processed {:>6} errors", stage.name, stage.processed, stage.errors);
    }
    println!("========================\n");
}

fn validate_command(config_path: PathBuf, concurrency: Option<usize>) -> Result<()> {
    let config = load_config(&config_path, concurrency)?;
    println!("Configuration is valid ({} stages)", config.stages.len());
    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# Pipeworks pipeline configuration

# Name shown in logs and progress reports
name: "dedupe-events"

# === I/O: one JSON value per line ===
input: "events.jsonl"
# Created or truncated
output: "bodies.jsonl"

# Bound of the queues between stages (omit for unbounded)
queue_capacity: 1024

# Tokio worker threads (null = num CPUs)
# worker_threads: 8

# === MONITOR: progress reporting ===
monitor:
  enabled: true
  # Seconds between progress reports
  interval_secs: 1
  # Save the final per-stage snapshot as JSON
  # stats_output_path: "snapshot.json"

# === STAGES: applied in order ===
# Available ops: passthrough, unique (key), select (field), flatten
stages:
  # Emit each element of array lines separately
  - op: flatten

  # Keep the first object per id
  - op: unique
    key: id
    concurrency: 4

  # Replace each object by its body
  - op: select
    field: body
    concurrency: 4
"#;

fn generate_config_command(output: PathBuf) -> Result<()> {
    std::fs::write(&output, SAMPLE_CONFIG)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
