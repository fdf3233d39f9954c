//! Queues and stage endpoints.

mod endpoint;
mod json_lines;
pub mod queue;
mod queue_io;
mod sequence;

pub use endpoint::{Input, IntoInput, IntoOutput, Output, SharedInput, SharedOutput};
pub use json_lines::JsonLinesIo;
pub use queue::{ClosableQueue, CloseHandle};
pub use queue_io::QueueIo;
pub use sequence::SequenceIo;
