//! In-memory FIFO with a broadcast close.
//!
//! Any number of consumers may be blocked in [`ClosableQueue::get`] when the
//! producer closes the queue, so closing cannot be a single poison item that
//! only one of them would see. Instead `close` enqueues a marker behind the
//! remaining items. The consumer that dequeues it resolves the closer's
//! [`CloseHandle`], flags the queue closed and wakes every other waiter.
//! Consumers check the flag before blocking, so a `get` issued after the
//! marker was consumed returns immediately.

use crate::error::{PipeError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{oneshot, Notify};

enum Envelope<T> {
    Item(T),
    Close(oneshot::Sender<()>),
}

/// Multi-consumer queue with a single-shot close protocol.
pub struct ClosableQueue<T> {
    tx: async_channel::Sender<Envelope<T>>,
    rx: async_channel::Receiver<Envelope<T>>,
    /// Set by the first `close` call.
    close_requested: AtomicBool,
    /// Set once the marker has been dequeued.
    closed: AtomicBool,
    wake: Notify,
}

impl<T> ClosableQueue<T> {
    pub fn unbounded() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self::from_channel(tx, rx)
    }

    /// A queue holding at most `capacity` items; `put` waits for room.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self::from_channel(tx, rx)
    }

    fn from_channel(tx: async_channel::Sender<Envelope<T>>, rx: async_channel::Receiver<Envelope<T>>) -> Self {
        Self {
            tx,
            rx,
            close_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Enqueue an item. Fails only when called after `close`.
    pub async fn put(&self, item: T) -> Result<()> {
        if self.close_requested.load(Ordering::Acquire) {
            return Err(PipeError::QueueClosed);
        }
        self.tx
            .send(Envelope::Item(item))
            .await
            .map_err(|_| PipeError::QueueClosed)
    }

    /// Wait for the next item. `None` means the queue is closed and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            // Register for the wake-up before checking the flag so a close
            // landing between the check and the wait is not missed.
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            tokio::select! {
                envelope = self.rx.recv() => match envelope {
                    Ok(Envelope::Item(item)) => return Some(item),
                    Ok(Envelope::Close(done)) => {
                        self.mark_closed();
                        let _ = done.send(());
                        return None;
                    }
                    // Every sender is gone; nothing more can arrive.
                    Err(_) => {
                        self.mark_closed();
                        return None;
                    }
                },
                _ = &mut notified => continue,
            }
        }
    }

    /// Enqueue the close marker.
    ///
    /// The returned handle resolves once a consumer has dequeued the marker.
    /// Repeated calls do not enqueue another marker and return a resolved handle.
    pub async fn close(&self) -> Result<CloseHandle> {
        if self.close_requested.swap(true, Ordering::AcqRel) {
            return Ok(CloseHandle { done: None });
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Envelope::Close(done_tx))
            .await
            .map_err(|_| PipeError::QueueClosed)?;
        tracing::debug!("close marker enqueued");
        Ok(CloseHandle { done: Some(done_rx) })
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    /// Number of items (including a pending close marker) currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }
}

/// Completion handle returned by [`ClosableQueue::close`].
#[derive(Debug)]
pub struct CloseHandle {
    done: Option<oneshot::Receiver<()>>,
}

impl CloseHandle {
    /// Wait until the close marker has been consumed.
    ///
    /// Also returns if the queue was dropped with the marker still inside.
    pub async fn drained(self) {
        if let Some(done) = self.done {
            let _ = done.await;
        }
    }
}
