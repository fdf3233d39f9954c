//! Stage execution, composition and monitoring.

mod builtin;
mod filters;
mod function;
mod monitor;
mod runner;
mod stages;


pub use builtin::BuiltinOp;
pub use filters::{unique_by, unique_field};
pub use function::{Capabilities, Continuation, Emitter, FnStage, Outcome};
pub use monitor::{render_report, PipelineMonitor};
pub use runner::{IntoStage, Item, Process, Stage, WorkerContext};
pub use stages::{Pipeline, PipelineSnapshot, PipelineStats, StageSnapshot, StageStats};
