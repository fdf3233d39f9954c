//! Error types for pipeline execution.
//!
//! End-of-stream is not an error: inputs report exhaustion with
//! `Ok(None)` and workers treat it as a normal exit.

use thiserror::Error;

/// Errors raised by queues, endpoints, stages and pipelines.
#[derive(Debug, Error)]
pub enum PipeError {
    /// Underlying read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line could not be decoded as JSON.
    #[error("could not decode JSON on line {line}: {source}")]
    Decode {
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be encoded as JSON.
    #[error("could not encode JSON value: {0}")]
    Encode(#[source] serde_json::Error),

    /// `put` was called after `close`.
    #[error("queue is closed")]
    QueueClosed,

    /// Invalid wiring or configuration, detected at construction or start.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure raised by user processing logic.
    #[error("processing failed: {0:#}")]
    Processing(#[from] anyhow::Error),

    /// A worker task panicked.
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
}

impl PipeError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipeError::Config(msg.into())
    }

    /// Whether the error stems from the data or the endpoint rather than user logic.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            PipeError::Io(_) | PipeError::Decode { .. } | PipeError::Encode(_)
        )
    }
}

pub type Result<T, E = PipeError> = std::result::Result<T, E>;
