//! Worker-pool execution of a single stage.
//!
//! A [`Stage`] runs its [`Process`] in `concurrency` independent workers that
//! all read from the same input and write to the same output. A worker ends
//! when its input is exhausted or when it returns an error; the error is
//! recorded on the stage status and its siblings keep going. Once every worker
//! has exited the output is closed exactly once, which is what lets the next
//! stage wind down.

use crate::error::{PipeError, Result};
use crate::io::{IntoInput, IntoOutput, SharedInput, SharedOutput};
use crate::status::StatusTracker;
use async_trait::async_trait;
use futures::future::select_all;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Bound shared by everything that flows through a pipeline.
pub trait Item: Send + fmt::Debug + 'static {}

impl<T: Send + fmt::Debug + 'static> Item for T {}

/// What a single worker sees.
pub struct WorkerContext<T> {
    pub input: SharedInput<T>,
    pub output: SharedOutput<T>,
    /// The owning stage's status.
    pub status: Arc<StatusTracker>,
    pub worker_id: usize,
}

/// Processing logic of a stage.
#[async_trait]
pub trait Process<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Run one worker loop until the input is exhausted.
    ///
    /// Returning an error ends this worker only.
    async fn run(&self, ctx: &WorkerContext<T>) -> Result<()>;
}

/// Anything that can be appended to a pipeline.
pub trait IntoStage<T> {
    fn into_stage(self) -> Stage<T>;
}

/// One step of a pipeline: logic, endpoints and a worker count.
pub struct Stage<T> {
    name: String,
    process: Arc<dyn Process<T>>,
    input: Option<SharedInput<T>>,
    output: Option<SharedOutput<T>>,
    concurrency: usize,
    status: Arc<StatusTracker>,
    running: Arc<AtomicUsize>,
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            process: Arc::clone(&self.process),
            input: self.input.clone(),
            output: self.output.clone(),
            concurrency: self.concurrency,
            status: Arc::clone(&self.status),
            running: Arc::clone(&self.running),
        }
    }
}

impl<T> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("has_input", &self.input.is_some())
            .field("has_output", &self.output.is_some())
            .finish()
    }
}

impl<T> IntoStage<T> for Stage<T> {
    fn into_stage(self) -> Stage<T> {
        self
    }
}

impl<T: Item> Stage<T> {
    pub fn new(process: Arc<dyn Process<T>>) -> Self {
        Self {
            name: process.name().to_string(),
            process,
            input: None,
            output: None,
            concurrency: 1,
            status: Self::fresh_status(),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn fresh_status() -> Arc<StatusTracker> {
        let status = StatusTracker::new();
        status.counter("processed_count").counter("workers_started");
        status
    }

    /// A copy sharing logic and endpoints but with its own status and
    /// worker count, for one pipeline run.
    pub(crate) fn fresh_run(&self) -> Self {
        Self {
            status: Self::fresh_status(),
            running: Arc::new(AtomicUsize::new(0)),
            ..self.clone()
        }
    }

    /// Number of concurrent workers. `0` runs a single worker inline,
    /// without spawning.
    pub fn parallel(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_input(mut self, input: impl IntoInput<T>) -> Self {
        self.input = Some(input.into_input());
        self
    }

    pub fn with_output(mut self, output: impl IntoOutput<T>) -> Self {
        self.output = Some(output.into_output());
        self
    }

    pub(crate) fn bind(&mut self, input: SharedInput<T>, output: SharedOutput<T>) {
        self.input = Some(input);
        self.output = Some(output);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }

    pub fn input(&self) -> Option<&SharedInput<T>> {
        self.input.as_ref()
    }

    pub fn output(&self) -> Option<&SharedOutput<T>> {
        self.output.as_ref()
    }

    /// Workers currently in flight.
    pub fn running_workers(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    /// Run all workers to completion, then close the output.
    pub async fn start(&self) -> Result<()> {
        let input = self
            .input
            .clone()
            .ok_or_else(|| PipeError::config(format!("stage `{}` has no input", self.name)))?;
        let output = self
            .output
            .clone()
            .ok_or_else(|| PipeError::config(format!("stage `{}` has no output", self.name)))?;

        let started = Instant::now();
        tracing::debug!(stage = %self.name, concurrency = self.concurrency, "starting stage");

        let mut failed = false;
        if self.concurrency == 0 {
            self.running.fetch_add(1, Ordering::Relaxed);
            self.status.inc("workers_started");
            let ctx = self.context(&input, &output, 0);
            let worker = run_worker(Arc::clone(&self.process), ctx);
            match AssertUnwindSafe(worker).catch_unwind().await {
                Ok(finished) => failed = !finished,
                Err(panic) => {
                    self.status.error(PipeError::WorkerPanicked(panic_message(panic.as_ref())), None);
                    failed = true;
                }
            }
            self.running.fetch_sub(1, Ordering::Relaxed);
        } else {
            let mut workers: Vec<_> = (0..self.concurrency)
                .map(|worker_id| {
                    self.status.inc("workers_started");
                    let ctx = self.context(&input, &output, worker_id);
                    tokio::spawn(run_worker(Arc::clone(&self.process), ctx))
                })
                .collect();
            self.running.fetch_add(workers.len(), Ordering::Relaxed);

            // Reap workers as they finish; they do not finish together.
            while !workers.is_empty() {
                let (result, _idx, remaining) = select_all(workers).await;
                workers = remaining;
                self.running.fetch_sub(1, Ordering::Relaxed);
                match result {
                    Ok(finished) => failed |= !finished,
                    Err(e) => {
                        let message = if e.is_panic() {
                            panic_message(e.into_panic().as_ref())
                        } else {
                            e.to_string()
                        };
                        self.status.error(PipeError::WorkerPanicked(message), None);
                        failed = true;
                    }
                }
            }
        }

        // Upstream may be blocked on a full queue that nobody reads anymore.
        if failed {
            self.discard_remaining(&input).await;
        }

        if let Err(e) = output.close().await {
            self.status.error(&e, None);
        }

        tracing::debug!(
            stage = %self.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            errors = self.status.error_count(),
            "stage finished"
        );
        Ok(())
    }

    async fn discard_remaining(&self, input: &SharedInput<T>) {
        let mut discarded = 0u64;
        loop {
            match input.read().await {
                Ok(Some(_)) => discarded += 1,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(stage = %self.name, error = %e, "stopped discarding input");
                    break;
                }
            }
        }
        if discarded > 0 {
            tracing::warn!(stage = %self.name, discarded, "workers exited early, discarded remaining input");
            self.status.add("discarded_count", discarded);
        }
    }

    fn context(&self, input: &SharedInput<T>, output: &SharedOutput<T>, worker_id: usize) -> WorkerContext<T> {
        WorkerContext {
            input: Arc::clone(input),
            output: Arc::clone(output),
            status: Arc::clone(&self.status),
            worker_id,
        }
    }
}

/// Returns whether the worker reached the end of its input.
async fn run_worker<T: Item>(process: Arc<dyn Process<T>>, ctx: WorkerContext<T>) -> bool {
    match process.run(&ctx).await {
        Ok(()) => {
            tracing::debug!(stage = process.name(), worker = ctx.worker_id, "worker reached end of input");
            true
        }
        Err(e) => {
            tracing::warn!(stage = process.name(), worker = ctx.worker_id, error = %e, "worker failed");
            ctx.status.error(&e, None);
            false
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{Input, Output, QueueIo, SequenceIo};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Copies items until the input runs dry.
    struct Forward;

    #[async_trait]
    impl Process<u32> for Forward {
        fn name(&self) -> &str {
            "forward"
        }

        async fn run(&self, ctx: &WorkerContext<u32>) -> Result<()> {
            while let Some(item) = ctx.input.read().await? {
                ctx.output.write(item).await?;
                ctx.status.inc("processed_count");
            }
            Ok(())
        }
    }

    /// Fails immediately.
    struct Broken;

    #[async_trait]
    impl Process<u32> for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn run(&self, _ctx: &WorkerContext<u32>) -> Result<()> {
            Err(PipeError::Processing(anyhow::anyhow!("worker cannot start")))
        }
    }

    /// Panics immediately.
    struct Panics;

    #[async_trait]
    impl Process<u32> for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        async fn run(&self, _ctx: &WorkerContext<u32>) -> Result<()> {
            panic!("worker exploded")
        }
    }

    /// Output that counts close calls.
    struct CountingOutput {
        inner: QueueIo<u32>,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl Output<u32> for CountingOutput {
        async fn write(&self, item: u32) -> Result<()> {
            self.inner.write(item).await
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close().await
        }

        fn status(&self) -> &Arc<StatusTracker> {
            Output::status(&self.inner)
        }
    }

    fn stage(process: impl Process<u32> + 'static) -> Stage<u32> {
        Stage::new(Arc::new(process))
    }

    async fn drain(io: &QueueIo<u32>) -> Vec<u32> {
        let mut items = Vec::new();
        while let Some(item) = io.read().await.unwrap() {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_single_worker_keeps_order() {
        let output = Arc::new(QueueIo::unbounded());
        let stage = stage(Forward)
            .with_input(SequenceIo::new(0..50u32))
            .with_output(Arc::clone(&output));

        stage.start().await.unwrap();
        assert_eq!(drain(&output).await, (0..50).collect::<Vec<_>>());
        assert_eq!(stage.running_workers(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_workers_close_output_once() {
        let output = Arc::new(CountingOutput {
            inner: QueueIo::unbounded(),
            closes: AtomicUsize::new(0),
        });
        let stage = stage(Forward)
            .parallel(3)
            .with_input(SequenceIo::new(0..100u32))
            .with_output(Arc::clone(&output));

        stage.start().await.unwrap();

        let mut items = drain(&output.inner).await;
        items.sort_unstable();
        assert_eq!(items, (0..100).collect::<Vec<_>>());
        assert_eq!(output.closes.load(Ordering::SeqCst), 1);
        assert_eq!(stage.status().get("workers_started"), 3);
        assert_eq!(stage.status().get("processed_count"), 100);
    }

    #[tokio::test]
    async fn test_failing_workers_still_close_output() {
        let output = Arc::new(QueueIo::<u32>::unbounded());
        let stage = stage(Broken)
            .parallel(2)
            .with_input(SequenceIo::new(0..10u32))
            .with_output(Arc::clone(&output));

        stage.start().await.unwrap();
        assert_eq!(stage.status().error_count(), 2);
        assert!(output.queue().is_close_requested());
        assert_eq!(output.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_inline_worker_panic_still_closes_output() {
        let output = Arc::new(QueueIo::<u32>::unbounded());
        let stage = stage(Panics)
            .parallel(0)
            .with_input(SequenceIo::new(0..10u32))
            .with_output(Arc::clone(&output));

        stage.start().await.unwrap();
        let errors = stage.status().errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("worker exploded"));
        assert_eq!(output.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_spawned_worker_panic_is_recorded() {
        let output = Arc::new(QueueIo::<u32>::unbounded());
        let stage = stage(Panics)
            .with_input(SequenceIo::new(0..10u32))
            .with_output(Arc::clone(&output));

        stage.start().await.unwrap();
        assert!(stage.status().errors()[0].message.contains("worker exploded"));
        assert_eq!(output.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_stage_discards_remaining_input() {
        let input = Arc::new(QueueIo::<u32>::bounded(1));
        let producer = {
            let input = Arc::clone(&input);
            tokio::spawn(async move {
                for i in 0..10 {
                    input.write(i).await.unwrap();
                }
                input.close().await.unwrap();
            })
        };

        let stage = stage(Broken)
            .with_input(Arc::clone(&input))
            .with_output(Arc::new(QueueIo::unbounded()));
        tokio::time::timeout(Duration::from_secs(5), stage.start())
            .await
            .expect("stage hung on a blocked producer")
            .unwrap();

        producer.await.unwrap();
        assert_eq!(stage.status().get("discarded_count"), 10);
    }

    #[tokio::test]
    async fn test_fresh_run_has_its_own_counters() {
        let original = stage(Forward)
            .with_input(SequenceIo::new(0..4u32))
            .with_output(Arc::new(QueueIo::unbounded()));
        let run = original.fresh_run();
        run.start().await.unwrap();

        assert_eq!(run.status().get("processed_count"), 4);
        assert_eq!(original.status().get("processed_count"), 0);
        assert_eq!(run.name(), original.name());
    }

    #[tokio::test]
    async fn test_concurrent_clones_count_running_workers_together() {
        let a_in = Arc::new(QueueIo::<u32>::unbounded());
        let b_in = Arc::new(QueueIo::<u32>::unbounded());
        let shared = stage(Forward);
        let a = shared
            .clone()
            .with_input(Arc::clone(&a_in))
            .with_output(Arc::new(QueueIo::unbounded()));
        let b = shared
            .clone()
            .parallel(2)
            .with_input(Arc::clone(&b_in))
            .with_output(Arc::new(QueueIo::unbounded()));

        let a_run = tokio::spawn(async move { a.start().await });
        let b_run = tokio::spawn(async move { b.start().await });
        tokio::time::timeout(Duration::from_secs(5), async {
            while shared.running_workers() < 3 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("workers never started");
        assert_eq!(shared.running_workers(), 3);

        a_in.close().await.unwrap();
        a_run.await.unwrap().unwrap();
        assert_eq!(shared.running_workers(), 2);

        b_in.close().await.unwrap();
        b_run.await.unwrap().unwrap();
        assert_eq!(shared.running_workers(), 0);
    }

    #[tokio::test]
    async fn test_unbound_stage_is_a_config_error() {
        let stage = stage(Forward).with_input(SequenceIo::new(0..3u32));
        assert!(matches!(stage.start().await, Err(PipeError::Config(_))));
    }
}
