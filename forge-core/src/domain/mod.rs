//! Core domain types
//!
//! Types produced by the decoder and consumed by the worker's pipelines.

pub mod reply;
pub mod task;

pub use reply::{Reply, TaskStatus};
pub use task::{SkipStages, TaskDescriptor, TaskKind};
