//! Chaining stages into a pipeline.
//!
//! A pipeline wires a junction queue between every pair of adjacent stages:
//!
//! ```text
//!  input ──▶ stage 0 ──▶ queue 0 ──▶ stage 1 ──▶ queue 1 ──▶ stage 2 ──▶ output
//! ```
//!
//! All stages start together. When the input runs dry the first stage closes
//! queue 0 once its workers have exited, which in turn ends stage 1, and so on
//! down to the pipeline output. A pipeline run finishes only when every stage
//! has drained.
//!
//! Pipelines are values: [`Pipeline::append_stage`] returns a new pipeline and
//! leaves the original untouched.

use crate::error::{PipeError, Result};
use crate::io::{IntoInput, IntoOutput, Output, QueueIo, SharedInput, SharedOutput};
use crate::pipeline::function::FnStage;
use crate::pipeline::runner::{IntoStage, Item, Process, Stage, WorkerContext};
use crate::status::{StatusSnapshot, StatusTracker};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, Serializer};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Stages as wired for the most recent run.
struct RunState<T> {
    started: Option<Instant>,
    finished: Option<Duration>,
    stages: Vec<Stage<T>>,
}

/// A named chain of stages with an external input and output.
pub struct Pipeline<T> {
    name: String,
    input: Option<SharedInput<T>>,
    output: Option<SharedOutput<T>>,
    stages: Vec<Stage<T>>,
    /// Junction queue bound; `None` is unbounded.
    queue_capacity: Option<usize>,
    run: Arc<Mutex<RunState<T>>>,
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            stages: self.stages.clone(),
            queue_capacity: self.queue_capacity,
            run: Arc::clone(&self.run),
        }
    }
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl<T: Item> Pipeline<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: None,
            output: None,
            stages: Vec::new(),
            queue_capacity: None,
            run: Self::fresh_run_state(),
        }
    }

    fn fresh_run_state() -> Arc<Mutex<RunState<T>>> {
        Arc::new(Mutex::new(RunState {
            started: None,
            finished: None,
            stages: Vec::new(),
        }))
    }

    /// A new pipeline with `stage` appended; `self` is unchanged.
    pub fn append_stage(&self, stage: impl IntoStage<T>) -> Self {
        let mut stages = self.stages.clone();
        stages.push(stage.into_stage());
        Self {
            name: self.name.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            stages,
            queue_capacity: self.queue_capacity,
            run: Self::fresh_run_state(),
        }
    }

    pub fn bind_input(mut self, input: impl IntoInput<T>) -> Self {
        self.input = Some(input.into_input());
        self
    }

    pub fn bind_output(mut self, output: impl IntoOutput<T>) -> Self {
        self.output = Some(output.into_output());
        self
    }

    pub fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> Option<&SharedInput<T>> {
        self.input.as_ref()
    }

    pub fn output(&self) -> Option<&SharedOutput<T>> {
        self.output.as_ref()
    }

    pub fn stages(&self) -> &[Stage<T>] {
        &self.stages
    }

    /// Time since the last run started, or its total duration once finished.
    pub fn runtime(&self) -> Duration {
        let run = self.run.lock();
        match (run.finished, run.started) {
            (Some(total), _) => total,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }

    /// Run every stage until the whole chain has drained.
    pub async fn start(&self) -> Result<PipelineStats> {
        let input = self
            .input
            .clone()
            .ok_or_else(|| PipeError::config(format!("pipeline `{}` has no input", self.name)))?;
        let output = self
            .output
            .clone()
            .ok_or_else(|| PipeError::config(format!("pipeline `{}` has no output", self.name)))?;
        self.run_with(input, output).await
    }

    async fn run_with(&self, input: SharedInput<T>, output: SharedOutput<T>) -> Result<PipelineStats> {
        let stages = self.wire(input, output);
        let started = Instant::now();
        {
            let mut run = self.run.lock();
            run.started = Some(started);
            run.finished = None;
            run.stages = stages.clone();
        }

        tracing::info!(pipeline = %self.name, stages = stages.len(), "starting pipeline");

        let results = join_all(stages.iter().map(|stage| stage.start())).await;

        let elapsed = started.elapsed();
        self.run.lock().finished = Some(elapsed);
        for result in results {
            result?;
        }

        let stats = PipelineStats {
            name: self.name.clone(),
            elapsed,
            stages: stages
                .iter()
                .map(|stage| StageStats {
                    name: stage.name().to_string(),
                    processed: stage.status().get("processed_count"),
                    errors: stage.status().error_count(),
                })
                .collect(),
        };
        tracing::info!(pipeline = %self.name, "{}", stats);
        Ok(stats)
    }

    /// Bind endpoints and junction queues onto copies of the stages.
    fn wire(&self, input: SharedInput<T>, output: SharedOutput<T>) -> Vec<Stage<T>> {
        let mut stages = if self.stages.is_empty() {
            vec![FnStage::identity().into_stage()]
        } else {
            self.stages.iter().map(Stage::fresh_run).collect()
        };

        let last = stages.len() - 1;
        let junctions: Vec<Arc<QueueIo<T>>> = (0..last)
            .map(|_| Arc::new(QueueIo::with_capacity(self.queue_capacity)))
            .collect();

        for (idx, stage) in stages.iter_mut().enumerate() {
            let stage_input: SharedInput<T> = if idx == 0 {
                Arc::clone(&input)
            } else {
                junctions[idx - 1].clone()
            };
            let stage_output: SharedOutput<T> = if idx == last {
                Arc::clone(&output)
            } else {
                junctions[idx].clone()
            };
            stage.bind(stage_input, stage_output);
        }
        stages
    }

    /// Current state of every stage, for polling by a monitor.
    pub fn snapshot(&self) -> PipelineSnapshot {
        let run = self.run.lock();
        let stages = if run.stages.is_empty() {
            &self.stages
        } else {
            &run.stages
        };
        let stages = stages
            .iter()
            .map(|stage| StageSnapshot {
                name: stage.name().to_string(),
                concurrency: stage.concurrency(),
                running_workers: stage.running_workers(),
                input: stage.input().map(|io| io.status().snapshot()),
                task: stage.status().snapshot(),
                output: stage.output().map(|io| io.status().snapshot()),
            })
            .collect();
        let runtime = match (run.finished, run.started) {
            (Some(total), _) => total,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        };

        PipelineSnapshot {
            name: self.name.clone(),
            runtime,
            stages,
        }
    }
}

impl<T: Item> IntoStage<T> for Pipeline<T> {
    fn into_stage(self) -> Stage<T> {
        Stage::new(Arc::new(self))
    }
}

/// A pipeline nested as a single stage of another.
#[async_trait]
impl<T: Item> Process<T> for Pipeline<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &WorkerContext<T>) -> Result<()> {
        // The wrapping stage closes the shared output once all its workers finish.
        let output: SharedOutput<T> = Arc::new(KeepOpen(Arc::clone(&ctx.output)));
        let stats = self.run_with(Arc::clone(&ctx.input), output).await?;
        ctx.status.add("processed_count", stats.processed_by_last());
        Ok(())
    }
}

/// Forwards writes but ignores `close`.
struct KeepOpen<T>(SharedOutput<T>);

#[async_trait]
impl<T: Item> Output<T> for KeepOpen<T> {
    async fn write(&self, item: T) -> Result<()> {
        self.0.write(item).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn status(&self) -> &Arc<StatusTracker> {
        self.0.status()
    }
}

/// Per-stage outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub name: String,
    /// Items that completed without error.
    pub processed: u64,
    pub errors: usize,
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub name: String,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub stages: Vec<StageStats>,
}

impl PipelineStats {
    pub fn total_errors(&self) -> usize {
        self.stages.iter().map(|s| s.errors).sum()
    }

    fn processed_by_last(&self) -> u64 {
        self.stages.last().map_or(0, |s| s.processed)
    }
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} stages in {:.2}s", self.name, self.stages.len(), self.elapsed.as_secs_f64())?;
        for stage in &self.stages {
            write!(f, " | {}: {} processed, {} errors", stage.name, stage.processed, stage.errors)?;
        }
        Ok(())
    }
}

/// Snapshot of one stage and its endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StageSnapshot {
    pub name: String,
    pub concurrency: usize,
    pub running_workers: usize,
    pub input: Option<StatusSnapshot>,
    pub task: StatusSnapshot,
    pub output: Option<StatusSnapshot>,
}

/// Snapshot of a whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub name: String,
    #[serde(serialize_with = "serialize_duration")]
    pub runtime: Duration,
    pub stages: Vec<StageSnapshot>,
}

impl PipelineSnapshot {
    /// Save the snapshot as pretty JSON.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Pipeline snapshot saved to {}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{Input, Output, SequenceIo};
    use crate::pipeline::function::Outcome;

    fn inc(name: &str) -> FnStage<i64> {
        FnStage::map(name.to_string(), |x: i64| Ok(Outcome::Emit(x + 1)))
    }

    async fn drain(io: &QueueIo<i64>) -> Vec<i64> {
        let mut items = Vec::new();
        while let Some(item) = io.read().await.unwrap() {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_append_returns_new_pipeline() {
        let output = Arc::new(QueueIo::<i64>::unbounded());
        let base = Pipeline::new("test").bind_output(Arc::clone(&output));
        let extended = base.append_stage(inc("a"));

        assert!(base.stages().is_empty());
        assert_eq!(extended.stages().len(), 1);
        assert_eq!(extended.name(), "test");
        assert!(extended.output().is_some());
    }

    #[tokio::test]
    async fn test_two_stages_chain_in_order() {
        let output = Arc::new(QueueIo::unbounded());
        let pipeline = Pipeline::new("chain")
            .append_stage(inc("first"))
            .append_stage(inc("second"))
            .bind_input(SequenceIo::new(0..10i64))
            .bind_output(Arc::clone(&output));

        let stats = pipeline.start().await.unwrap();

        assert_eq!(drain(&output).await, (2..12).collect::<Vec<_>>());
        assert_eq!(stats.stages.len(), 2);
        assert_eq!(stats.stages[0].processed, 10);
        assert_eq!(stats.stages[1].processed, 10);
        assert_eq!(stats.total_errors(), 0);
    }

    #[tokio::test]
    async fn test_empty_pipeline_passes_through() {
        let output = Arc::new(QueueIo::unbounded());
        let pipeline = Pipeline::new("noop")
            .bind_input(vec![5i64, 6, 7])
            .bind_output(Arc::clone(&output));

        let stats = pipeline.start().await.unwrap();
        assert_eq!(drain(&output).await, vec![5, 6, 7]);
        assert_eq!(stats.stages[0].name, "identity");
    }

    #[tokio::test]
    async fn test_missing_endpoints_are_config_errors() {
        let pipeline = Pipeline::<i64>::new("nothing");
        assert!(matches!(pipeline.start().await, Err(PipeError::Config(_))));

        let pipeline = pipeline.bind_input(vec![1i64]);
        assert!(matches!(pipeline.start().await, Err(PipeError::Config(_))));
    }

    #[tokio::test]
    async fn test_rerun_after_reset() {
        let input = Arc::new(SequenceIo::new(0..5i64));
        let first_out = Arc::new(QueueIo::unbounded());
        let pipeline = Pipeline::new("rerun")
            .append_stage(inc("inc"))
            .bind_input(Arc::clone(&input))
            .bind_output(Arc::clone(&first_out));
        pipeline.start().await.unwrap();
        assert_eq!(drain(&first_out).await, vec![1, 2, 3, 4, 5]);

        input.reset();
        let second_out = Arc::new(QueueIo::unbounded());
        let pipeline = pipeline.bind_output(Arc::clone(&second_out));
        let stats = pipeline.start().await.unwrap();
        assert_eq!(drain(&second_out).await, vec![1, 2, 3, 4, 5]);
        assert_eq!(stats.stages[0].processed, 5);
        assert_eq!(pipeline.snapshot().stages[0].task.count("processed_count"), Some(5));
    }

    #[tokio::test]
    async fn test_appended_pipeline_keeps_separate_counts() {
        let base = Pipeline::new("base").append_stage(inc("a"));
        let extended = base.append_stage(inc("b"));

        let base_out = Arc::new(QueueIo::unbounded());
        let base_stats = base
            .clone()
            .bind_input(SequenceIo::new(0..3i64))
            .bind_output(Arc::clone(&base_out))
            .start()
            .await
            .unwrap();
        let ext_out = Arc::new(QueueIo::unbounded());
        let ext_stats = extended
            .bind_input(SequenceIo::new(0..7i64))
            .bind_output(Arc::clone(&ext_out))
            .start()
            .await
            .unwrap();

        assert_eq!(base_stats.stages[0].processed, 3);
        assert_eq!(ext_stats.stages[0].processed, 7);
        assert_eq!(ext_stats.stages[1].processed, 7);
    }

    #[tokio::test]
    async fn test_junctions_are_closed_after_run() {
        let output = Arc::new(QueueIo::unbounded());
        let pipeline = Pipeline::new("junctions")
            .append_stage(inc("a"))
            .append_stage(inc("b"))
            .append_stage(inc("c"))
            .bind_input(vec![0i64])
            .bind_output(Arc::clone(&output));
        pipeline.start().await.unwrap();

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.stages.len(), 3);
        for stage in &snapshot.stages[..2] {
            let out = stage.output.as_ref().unwrap();
            assert!(out.flag("closed"));
            assert_eq!(out.count("write_count"), Some(1));
        }
        assert!(Output::status(output.as_ref()).snapshot().flag("closed"));
        assert!(pipeline.runtime() > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_bounded_junctions() {
        let output = Arc::new(QueueIo::unbounded());
        let pipeline = Pipeline::new("bounded")
            .with_queue_capacity(Some(2))
            .append_stage(inc("a"))
            .append_stage(inc("b"))
            .bind_input(SequenceIo::new(0..100i64))
            .bind_output(Arc::clone(&output));
        pipeline.start().await.unwrap();
        assert_eq!(drain(&output).await, (2..102).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_nested_pipeline_as_stage() {
        let inner = Pipeline::new("inner").append_stage(inc("x")).append_stage(inc("y"));
        let output = Arc::new(QueueIo::unbounded());
        let outer = Pipeline::new("outer")
            .append_stage(inc("before"))
            .append_stage(inner)
            .bind_input(SequenceIo::new(0..4i64))
            .bind_output(Arc::clone(&output));

        let stats = outer.start().await.unwrap();
        assert_eq!(drain(&output).await, vec![3, 4, 5, 6]);
        assert_eq!(stats.stages[1].name, "inner");
        assert_eq!(stats.stages[1].processed, 4);
    }

    #[test]
    fn test_pipeline_stats_display() {
        let stats = PipelineStats {
            name: "demo".to_string(),
            elapsed: Duration::from_millis(1500),
            stages: vec![StageStats {
                name: "parse".to_string(),
                processed: 90,
                errors: 10,
            }],
        };
        let display = format!("{}", stats);
        assert!(display.contains("demo"));
        assert!(display.contains("parse: 90 processed, 10 errors"));
        assert_eq!(stats.total_errors(), 10);
    }
}
