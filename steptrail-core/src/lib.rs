//! # steptrail-core
//!
//! Hierarchical execution tracing for asynchronous pipelines.
//!
//! Wrap arbitrary async work in named steps; the library records the tree
//! of steps that actually executed, their timing, user-supplied records,
//! return values and errors. The top-level step is a [`Pipeline`], which
//! adds a run id and can stream lifecycle events to a [`Transport`].
//!
//! This crate provides:
//! - The step tree and event bus (`step`, `bus`)
//! - The pipeline root and auto-save driving (`pipeline`)
//! - Metadata value records and the wire format (`meta`)
//! - The transport seam implemented by `steptrail-transport` (`transport`)

pub mod bus;
pub mod error;
pub mod logging;
pub mod meta;
pub mod pipeline;
pub mod prelude;
pub mod step;
pub mod transport;

// Re-export common types for convenience
pub use bus::{EventName, FnListener, StepEvent, StepListener};
pub use error::{Error, Result};
pub use meta::{ErrorMeta, NestedStepMeta, PipelineMeta, RunStatus, StepMeta, TimeMeta};
pub use pipeline::{AutoSave, Pipeline, PipelineOptions};
pub use step::{Step, StepStatus};
pub use transport::Transport;
