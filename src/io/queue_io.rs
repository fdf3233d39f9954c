//! Queue-backed endpoint used for junctions between stages.

use crate::error::Result;
use crate::io::queue::ClosableQueue;
use crate::io::{Input, Output};
use crate::status::StatusTracker;
use async_trait::async_trait;
use std::sync::Arc;

/// Both ends of a [`ClosableQueue`], with read/write accounting.
pub struct QueueIo<T> {
    queue: Arc<ClosableQueue<T>>,
    status: Arc<StatusTracker>,
}

impl<T: Send + 'static> QueueIo<T> {
    pub fn unbounded() -> Self {
        Self::with_queue(Arc::new(ClosableQueue::unbounded()))
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_queue(Arc::new(ClosableQueue::bounded(capacity)))
    }

    /// Unbounded when `capacity` is `None`.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        match capacity {
            Some(capacity) => Self::bounded(capacity),
            None => Self::unbounded(),
        }
    }

    pub fn with_queue(queue: Arc<ClosableQueue<T>>) -> Self {
        let status = StatusTracker::new();
        let probe_queue = Arc::clone(&queue);
        status
            .counter("read_count")
            .counter("write_count")
            .flag("closed")
            .probe("queued", move || probe_queue.len() as u64)
            .percentage("done", "read_count", "write_count");
        Self { queue, status }
    }

    pub fn queue(&self) -> &Arc<ClosableQueue<T>> {
        &self.queue
    }
}

#[async_trait]
impl<T: Send + 'static> Input<T> for QueueIo<T> {
    async fn read(&self) -> Result<Option<T>> {
        let item = self.queue.get().await;
        if item.is_some() {
            self.status.inc("read_count");
        }
        Ok(item)
    }

    fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }
}

#[async_trait]
impl<T: Send + 'static> Output<T> for QueueIo<T> {
    async fn write(&self, item: T) -> Result<()> {
        self.queue.put(item).await?;
        self.status.inc("write_count");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.status.set_flag("closed", true);
        // Nobody waits for the drain: downstream may already be gone.
        self.queue.close().await?;
        Ok(())
    }

    fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }
}
