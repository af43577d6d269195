//! Prelude: Re-exports common types for convenience
//!
//! # Usage
//! ```
//! use steptrail_core::prelude::*;
//! ```

pub use crate::error::{Error, Result};

// Step tree
pub use crate::step::{Step, StepStatus};

// Events
pub use crate::bus::{EventName, FnListener, StepEvent, StepListener};

// Pipeline
pub use crate::pipeline::{AutoSave, Pipeline, PipelineOptions};

// Metadata
pub use crate::meta::{
    ErrorMeta, NestedStepMeta, PipelineMeta, RunStatus, StepMeta, TimeMeta,
};

// Transport seam
pub use crate::transport::Transport;

// Logging
pub use crate::logging::{init_logging, LoggingOptions};
