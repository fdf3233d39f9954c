//! Pipeworks
//!
//! Concurrent, staged processing of item streams on Tokio.
//!
//! # Architecture
//!
//! - **Status**: a tree of counters, flags, percentages and error records
//!   that every component exposes for polling
//! - **I/O**: a closable multi-consumer queue and the endpoints stages read
//!   from and write to (queues, in-memory sequences, JSON-lines files)
//! - **Pipeline**: worker-pool stages, plain functions adapted as stages, and
//!   pipelines chaining them through junction queues, plus a progress monitor
//!
//! # Usage
//!
//! ```no_run
//! use pipeworks::io::QueueIo;
//! use pipeworks::pipeline::{FnStage, Outcome, Pipeline};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let output = Arc::new(QueueIo::unbounded());
//!     let pipeline = Pipeline::new("squares")
//!         .append_stage(FnStage::map("square", |x: i64| Ok(Outcome::Emit(x * x))).parallel(4))
//!         .bind_input(vec![1i64, 2, 3])
//!         .bind_output(Arc::clone(&output));
//!     let stats = pipeline.start().await?;
//!     println!("{}", stats);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod status;

pub use config::{Config, MonitorConfig, StageConfig};
pub use error::{PipeError, Result};
pub use pipeline::{FnStage, Outcome, Pipeline, PipelineMonitor, PipelineStats, Stage};
pub use status::StatusTracker;

use anyhow::Context;
use io::JsonLinesIo;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Build the configured stages into an unbound pipeline.
pub fn build_pipeline(config: &Config) -> Pipeline<Value> {
    let pipeline = Pipeline::new(&config.name).with_queue_capacity(config.queue_capacity);
    config.stages.iter().fold(pipeline, |pipeline, stage| {
        pipeline.append_stage(stage.op.build().parallel(stage.concurrency))
    })
}

/// Run a JSON-lines pipeline described by `config`.
pub async fn run_pipeline(config: Config) -> anyhow::Result<PipelineStats> {
    config.validate()?;

    tracing::info!("Starting pipeline `{}`", config.name);
    tracing::info!("Reading items from {}", config.input);

    let input = JsonLinesIo::<Value>::open(&config.input)
        .await
        .with_context(|| format!("Failed to open input {}", config.input))?;
    let output = JsonLinesIo::<Value>::create(&config.output)
        .await
        .with_context(|| format!("Failed to create output {}", config.output))?;

    let pipeline = build_pipeline(&config)
        .bind_input(Arc::new(input))
        .bind_output(Arc::new(output));

    let stats = if config.monitor.enabled {
        let interval = Duration::from_secs(config.monitor.interval_secs);
        PipelineMonitor::new(pipeline.clone(), interval).watch().await?
    } else {
        pipeline.start().await?
    };

    if let Some(path) = &config.monitor.stats_output_path {
        pipeline.snapshot().save_to_file(path)?;
    }

    tracing::info!("Results written to {}", config.output);
    Ok(stats)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::BuiltinOp;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir, stages: Vec<StageConfig>) -> Config {
        let mut config = Config::from_yaml("input: in.jsonl\noutput: out.jsonl\n").unwrap();
        config.input = dir.path().join("in.jsonl").display().to_string();
        config.output = dir.path().join("out.jsonl").display().to_string();
        config.stages = stages;
        config
    }

    #[tokio::test]
    async fn test_run_pipeline_end_to_end() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(
            &dir,
            vec![
                StageConfig {
                    op: BuiltinOp::Unique { key: "id".to_string() },
                    concurrency: 2,
                },
                StageConfig {
                    op: BuiltinOp::Select { field: "id".to_string() },
                    concurrency: 1,
                },
            ],
        );
        config.monitor.enabled = false;
        std::fs::write(&config.input, "{\"id\":1}\n{\"id\":1}\n{\"x\":0}\n").unwrap();

        let stats = run_pipeline(config.clone()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&config.output).unwrap(), "1\n");
        assert_eq!(stats.stages.len(), 2);
        assert_eq!(stats.total_errors(), 1);
    }

    #[tokio::test]
    async fn test_run_pipeline_with_monitor_saves_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir, Vec::new());
        let snapshot_path = dir.path().join("snapshot.json");
        config.monitor.stats_output_path = Some(snapshot_path.display().to_string());
        std::fs::write(&config.input, "\"a\"\n\"b\"\n").unwrap();

        let stats = run_pipeline(config.clone()).await.unwrap();
        assert_eq!(stats.stages[0].processed, 2);
        assert_eq!(std::fs::read_to_string(&config.output).unwrap(), "\"a\"\n\"b\"\n");

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&snapshot_path).unwrap()).unwrap();
        assert_eq!(saved["stages"][0]["name"], "identity");
    }

    #[tokio::test]
    async fn test_missing_input_file() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, Vec::new());
        let err = run_pipeline(config).await.unwrap_err();
        assert!(err.to_string().contains("Failed to open input"));
    }

    #[test]
    fn test_build_pipeline_names_stages() {
        let dir = TempDir::new().unwrap();
        let config = config_in(
            &dir,
            vec![StageConfig {
                op: BuiltinOp::Flatten,
                concurrency: 3,
            }],
        );
        let pipeline = build_pipeline(&config);
        assert_eq!(pipeline.stages()[0].name(), "flatten");
        assert_eq!(pipeline.stages()[0].concurrency(), 3);
    }
}
