//! Read-only endpoint over an in-memory sequence.

use crate::error::Result;
use crate::io::Input;
use crate::status::StatusTracker;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

type BoxIter<T> = Box<dyn Iterator<Item = T> + Send>;
type IterFactory<T> = Box<dyn Fn() -> BoxIter<T> + Send + Sync>;

/// Yields the items of a (possibly infinite) sequence, then end-of-stream.
pub struct SequenceIo<T> {
    factory: IterFactory<T>,
    iter: Mutex<BoxIter<T>>,
    status: Arc<StatusTracker>,
}

impl<T: Send + 'static> SequenceIo<T> {
    /// Wrap anything that can be iterated more than once.
    ///
    /// When the iterator reports an exact length, `left_count` and the
    /// `done` percentage are tracked.
    pub fn new<I>(iterable: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        let status = StatusTracker::new();
        status.counter("read_count").flag("closed");

        if let (lower, Some(upper)) = iterable.clone().into_iter().size_hint() {
            if lower == upper {
                status.set("left_count", lower as u64);
                status.percentage("done", "read_count", "left_count");
            }
        }

        let factory: IterFactory<T> = Box::new(move || Box::new(iterable.clone().into_iter()));
        let iter = Mutex::new(factory());
        Self {
            factory,
            iter,
            status,
        }
    }

    /// Restart from the first item.
    pub fn reset(&self) {
        *self.iter.lock() = (self.factory)();
        self.status.set("read_count", 0);
        self.status.set_flag("closed", false);
    }
}

#[async_trait]
impl<T: Send + 'static> Input<T> for SequenceIo<T> {
    async fn read(&self) -> Result<Option<T>> {
        let next = self.iter.lock().next();
        match next {
            Some(item) => {
                self.status.inc("read_count");
                Ok(Some(item))
            }
            None => {
                self.status.set_flag("closed", true);
                Ok(None)
            }
        }
    }

    fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }
}
