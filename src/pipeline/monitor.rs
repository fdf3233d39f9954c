//! Periodic progress reporting for a running pipeline.

use crate::error::Result;
use crate::io::{IntoOutput, SharedOutput};
use crate::pipeline::runner::Item;
use crate::pipeline::stages::{Pipeline, PipelineSnapshot, PipelineStats, StageSnapshot};
use crate::status::{Percentage, StatusSnapshot};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Width of a rendered progress bar, brackets excluded.
const BAR_WIDTH: usize = 20;

/// Polls a pipeline and reports its progress at a fixed interval.
pub struct PipelineMonitor<T> {
    pipeline: Pipeline<T>,
    interval: Duration,
    output: Option<SharedOutput<String>>,
}

impl<T: Item> PipelineMonitor<T> {
    pub fn new(pipeline: Pipeline<T>, interval: Duration) -> Self {
        Self {
            pipeline,
            interval,
            output: None,
        }
    }

    /// Send reports to `output` instead of the log.
    pub fn with_output(mut self, output: impl IntoOutput<String>) -> Self {
        self.output = Some(output.into_output());
        self
    }

    /// Report until `shutdown` fires, then report once more.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.report().await,
                _ = shutdown.recv() => {
                    self.report().await;
                    break;
                }
            }
        }
    }

    /// Run the pipeline with the monitor attached.
    ///
    /// The report output, if any, is closed after the final report.
    pub async fn watch(self) -> Result<PipelineStats> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let pipeline = async {
            let result = self.pipeline.start().await;
            let _ = shutdown_tx.send(()).await;
            result
        };
        let (_, result) = tokio::join!(self.run(shutdown_rx), pipeline);

        if let Some(output) = &self.output {
            if let Err(e) = output.close().await {
                tracing::warn!("Failed to close monitor output: {}", e);
            }
        }
        result
    }

    async fn report(&self) {
        let report = render_report(&self.pipeline.snapshot());
        match &self.output {
            Some(output) => {
                if let Err(e) = output.write(report).await {
                    tracing::warn!("Failed to write monitor report: {}", e);
                }
            }
            None => tracing::info!("\n{}", report),
        }
    }
}

/// Render a pipeline snapshot as a multi-line console report.
pub fn render_report(snapshot: &PipelineSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}: {} stages", snapshot.name, snapshot.stages.len());
    let _ = writeln!(out, "Runtime: {:.0} seconds", snapshot.runtime.as_secs_f64());
    for stage in &snapshot.stages {
        render_stage(&mut out, stage);
    }
    out
}

fn render_stage(out: &mut String, stage: &StageSnapshot) {
    let _ = writeln!(
        out,
        "---------| {} [workers: {}/{}] [errors: {}]",
        stage.name,
        stage.running_workers,
        stage.concurrency,
        stage.task.errors.len()
    );

    let input = stage.input.as_ref();
    match input.and_then(input_progress) {
        Some(progress) => {
            let _ = writeln!(
                out,
                "{:11}Input: {}/{} read. {}% done",
                "", progress.data.0, progress.data.1, progress.percent
            );
            let _ = writeln!(out, "{:11}{}", "", progress_bar(&progress));
        }
        None => {
            let read = input.and_then(|s| s.count("read_count")).unwrap_or(0);
            let _ = writeln!(out, "{:11}Input: {}/? read", "", read);
        }
    }

    if !stage.task.subtasks.is_empty() {
        let _ = writeln!(out, "{:11}Tasks:", "");
        for task in &stage.task.subtasks {
            match task.percentage("done") {
                Some(progress) => {
                    let _ = writeln!(out, "{:2}--------| {}", "", progress_bar(progress));
                }
                None => {
                    let done = task.count("done_count").unwrap_or(0);
                    let _ = writeln!(out, "{:2}--------| {} steps", "", done);
                }
            }
        }
    }
}

/// Progress of an input: `done` for counted sources, `read` for byte streams.
fn input_progress(input: &StatusSnapshot) -> Option<Percentage> {
    input
        .percentage("done")
        .or_else(|| input.percentage("read"))
        .copied()
}

fn progress_bar(progress: &Percentage) -> String {
    let filled = (usize::from(progress.percent) * BAR_WIDTH / 100).clamp(1, BAR_WIDTH);
    format!(
        "[{}*{}] {:>3}/{}",
        "=".repeat(filled - 1),
        " ".repeat(BAR_WIDTH - filled),
        progress.data.0,
        progress.data.1
    )
}
