//! Stage endpoint capabilities.
//!
//! A stage reads from an [`Input`] and writes to an [`Output`]. Concrete
//! endpoints are turned into shared trait objects through [`IntoInput`] and
//! [`IntoOutput`], so the kind of endpoint is fixed when the pipeline is wired.

use crate::error::Result;
use crate::io::SequenceIo;
use crate::status::StatusTracker;
use async_trait::async_trait;
use std::sync::Arc;

/// Readable side of a stage.
#[async_trait]
pub trait Input<T>: Send + Sync {
    /// Next item, or `None` once the input is exhausted.
    async fn read(&self) -> Result<Option<T>>;

    fn status(&self) -> &Arc<StatusTracker>;
}

/// Writable side of a stage.
#[async_trait]
pub trait Output<T>: Send + Sync {
    async fn write(&self, item: T) -> Result<()>;

    /// Signal that no more items will be written. Must tolerate repeated calls.
    async fn close(&self) -> Result<()>;

    fn status(&self) -> &Arc<StatusTracker>;
}

pub type SharedInput<T> = Arc<dyn Input<T>>;
pub type SharedOutput<T> = Arc<dyn Output<T>>;

/// Conversion into a shared input.
pub trait IntoInput<T> {
    fn into_input(self) -> SharedInput<T>;
}

/// Conversion into a shared output.
pub trait IntoOutput<T> {
    fn into_output(self) -> SharedOutput<T>;
}

impl<T, E> IntoInput<T> for Arc<E>
where
    E: Input<T> + 'static,
{
    fn into_input(self) -> SharedInput<T> {
        self
    }
}

impl<T, E> IntoOutput<T> for Arc<E>
where
    E: Output<T> + 'static,
{
    fn into_output(self) -> SharedOutput<T> {
        self
    }
}

impl<T> IntoInput<T> for SequenceIo<T>
where
    T: Send + 'static,
{
    fn into_input(self) -> SharedInput<T> {
        Arc::new(self)
    }
}

impl<T> IntoInput<T> for Vec<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn into_input(self) -> SharedInput<T> {
        Arc::new(SequenceIo::new(self))
    }
}
