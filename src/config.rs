//! Configuration for the `pipeworks` command line.

use crate::pipeline::BuiltinOp;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A JSON-lines pipeline described in a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pipeline name used in logs and reports
    #[serde(default = "default_name")]
    pub name: String,

    /// JSON-lines file to read items from
    pub input: String,

    /// JSON-lines file to write results to (created or truncated)
    pub output: String,

    /// Bound of the queues between stages; unbounded when absent
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Progress reporting
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Stages, in order. An empty list copies input to output.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// Progress reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Log a progress report while the pipeline runs
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between reports
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Optional path to save the final pipeline snapshot as JSON
    #[serde(default)]
    pub stats_output_path: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 1,
            stats_output_path: None,
        }
    }
}

/// One stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(flatten)]
    pub op: BuiltinOp,

    /// Number of concurrent workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// A starting point for `generate-config`.
    pub fn example() -> Self {
        Self {
            name: "dedupe-events".to_string(),
            input: "events.jsonl".to_string(),
            output: "bodies.jsonl".to_string(),
            queue_capacity: Some(1024),
            worker_threads: None,
            monitor: MonitorConfig::default(),
            stages: vec![
                StageConfig {
                    op: BuiltinOp::Flatten,
                    concurrency: 1,
                },
                StageConfig {
                    op: BuiltinOp::Unique { key: "id".to_string() },
                    concurrency: 4,
                },
                StageConfig {
                    op: BuiltinOp::Select { field: "body".to_string() },
                    concurrency: 4,
                },
            ],
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input.is_empty() {
            anyhow::bail!("Input path must not be empty");
        }
        if self.output.is_empty() {
            anyhow::bail!("Output path must not be empty");
        }
        if self.input == self.output {
            anyhow::bail!("Input and output must be different files");
        }
        if self.queue_capacity == Some(0) {
            anyhow::bail!("Queue capacity must be > 0 (omit it for unbounded queues)");
        }
        if self.worker_threads == Some(0) {
            anyhow::bail!("Worker threads must be > 0");
        }
        if self.monitor.interval_secs == 0 {
            anyhow::bail!("Monitor interval must be > 0");
        }
        for (idx, stage) in self.stages.iter().enumerate() {
            match &stage.op {
                BuiltinOp::Unique { key } if key.is_empty() => {
                    anyhow::bail!("Stage {} ({}): key must not be empty", idx, stage.op.name());
                }
                BuiltinOp::Select { field } if field.is_empty() => {
                    anyhow::bail!("Stage {} ({}): field must not be empty", idx, stage.op.name());
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Apply a concurrency override to every stage.
    pub fn set_concurrency(&mut self, concurrency: usize) {
        for stage in &mut self.stages {
            stage.concurrency = concurrency;
        }
    }
}

fn default_name() -> String { "pipeline".to_string() }
fn default_true() -> bool { true }
fn default_interval_secs() -> u64 { 1 }
fn default_concurrency() -> usize { 1 }
