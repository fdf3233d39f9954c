//! Plain functions as pipeline stages.
//!
//! A [`FnStage`] wraps a per-item function. Which optional capabilities the
//! function takes (currently only the [`Emitter`]) is fixed by the constructor
//! used, and can be queried with [`FnStage::capabilities`].
//!
//! Each item read from the input is processed inside its own status subtask:
//!
//! - `Outcome::Emit(v)` writes `v` to the output,
//! - `Outcome::Skip` writes nothing,
//! - `Outcome::Continue(c)` calls the function again on `c.data` without
//!   reading a new item, merging the continuation's progress counters,
//! - an error is recorded against the subtask and the item is dropped.
//!
//! None of these end the worker. Only a failing read does.

use crate::error::{PipeError, Result};
use crate::io::SharedOutput;
use crate::pipeline::runner::{IntoStage, Item, Process, Stage, WorkerContext};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt::{self, Write as _};
use std::future::Future;
use std::sync::Arc;

/// Longest item rendering kept in an error record.
const MAX_ITEM_LABEL: usize = 256;

/// Result of one invocation of a stage function.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// Write this value to the output.
    Emit(T),
    /// Nothing to write for this item.
    Skip,
    /// Process replacement data before reading the next item.
    Continue(Continuation<T>),
}

impl<T> From<T> for Outcome<T> {
    fn from(value: T) -> Self {
        Outcome::Emit(value)
    }
}

impl<T> Outcome<T> {
    /// `Emit` for `Some`, `Skip` for `None`.
    pub fn from_option(value: Option<T>) -> Self {
        value.map_or(Outcome::Skip, Outcome::Emit)
    }
}

/// Replacement data plus optional progress for a multi-step item.
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation<T> {
    pub data: T,
    pub done: Option<u64>,
    pub max: Option<u64>,
}

impl<T> Continuation<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            done: None,
            max: None,
        }
    }

    pub fn with_done(mut self, done: u64) -> Self {
        self.done = Some(done);
        self
    }

    pub fn with_max(mut self, max: u64) -> Self {
        self.max = Some(max);
        self
    }
}

/// Direct access to the stage output, for functions that fan out.
pub struct Emitter<T> {
    output: SharedOutput<T>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            output: Arc::clone(&self.output),
        }
    }
}

impl<T: Item> Emitter<T> {
    pub async fn emit(&self, item: T) -> Result<()> {
        self.output.write(item).await
    }
}

/// Optional capabilities a stage function accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub emit: bool,
}

type FnResult<T> = anyhow::Result<Outcome<T>>;
type SyncFn<T> = Box<dyn Fn(T) -> FnResult<T> + Send + Sync>;
type AsyncFn<T> = Box<dyn Fn(T) -> BoxFuture<'static, FnResult<T>> + Send + Sync>;
type EmitFn<T> = Box<dyn Fn(T, Emitter<T>) -> BoxFuture<'static, FnResult<T>> + Send + Sync>;

enum Handler<T> {
    Sync(SyncFn<T>),
    Async(AsyncFn<T>),
    Emitting(EmitFn<T>),
}

/// A stage built from a per-item function.
pub struct FnStage<T> {
    name: String,
    handler: Handler<T>,
}

impl<T: Item> FnStage<T> {
    /// Wrap a synchronous function.
    pub fn map<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(T) -> FnResult<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Handler::Sync(Box::new(f)),
        }
    }

    /// Wrap an asynchronous function; its future is awaited before the
    /// outcome is interpreted.
    pub fn map_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FnResult<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Handler::Async(Box::new(move |item| f(item).boxed())),
        }
    }

    /// Wrap an asynchronous function that may write extra items itself.
    pub fn with_emit<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(T, Emitter<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FnResult<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Handler::Emitting(Box::new(move |item, emitter| f(item, emitter).boxed())),
        }
    }

    /// Pass every item through unchanged.
    pub fn identity() -> Self {
        Self::map("identity", |item| Ok(Outcome::Emit(item)))
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            emit: matches!(self.handler, Handler::Emitting(_)),
        }
    }

    /// Shorthand for `into_stage().parallel(concurrency)`.
    pub fn parallel(self, concurrency: usize) -> Stage<T> {
        self.into_stage().parallel(concurrency)
    }

    async fn invoke(&self, data: T, output: &SharedOutput<T>) -> FnResult<T> {
        match &self.handler {
            Handler::Sync(f) => f(data),
            Handler::Async(f) => f(data).await,
            Handler::Emitting(f) => {
                let emitter = Emitter {
                    output: Arc::clone(output),
                };
                f(data, emitter).await
            }
        }
    }
}

impl<T: Item> IntoStage<T> for FnStage<T> {
    fn into_stage(self) -> Stage<T> {
        Stage::new(Arc::new(self))
    }
}

#[async_trait]
impl<T: Item> Process<T> for FnStage<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &WorkerContext<T>) -> Result<()> {
        // A failed read ends this worker; everything below is per item.
        while let Some(mut data) = ctx.input.read().await? {
            let task = ctx.status.subtask();
            task.counter("done_count")
                .counter("max_count")
                .percentage("done", "done_count", "max_count");

            loop {
                let label = item_label(&data);
                match self.invoke(data, &ctx.output).await {
                    Ok(Outcome::Continue(next)) => {
                        task.inc("done_count");
                        if let Some(max) = next.max {
                            task.set("max_count", max);
                        }
                        if let Some(done) = next.done {
                            task.set("done_count", done);
                        }
                        data = next.data;
                        continue;
                    }
                    Ok(Outcome::Emit(value)) => {
                        task.inc("done_count");
                        match ctx.output.write(value).await {
                            Ok(()) => ctx.status.inc("processed_count"),
                            Err(e) => task.error(&e, Some(label)),
                        }
                    }
                    Ok(Outcome::Skip) => {
                        task.inc("done_count");
                        ctx.status.inc("processed_count");
                    }
                    Err(e) => {
                        task.error(PipeError::Processing(e), Some(label));
                    }
                }
                break;
            }
        }
        Ok(())
    }
}

/// Collects at most `MAX_ITEM_LABEL` bytes, then fails the formatter so
/// large items stop rendering early.
struct LabelWriter {
    buf: String,
    truncated: bool,
}

impl fmt::Write for LabelWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = MAX_ITEM_LABEL - self.buf.len();
        if s.len() <= room {
            self.buf.push_str(s);
            return Ok(());
        }
        let mut end = room;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.push_str(&s[..end]);
        self.truncated = true;
        Err(fmt::Error)
    }
}

fn item_label<T: fmt::Debug>(item: &T) -> String {
    let mut writer = LabelWriter {
        buf: String::new(),
        truncated: false,
    };
    let _ = write!(writer, "{item:?}");
    if writer.truncated {
        writer.buf.push_str("...");
    }
    writer.buf
}
