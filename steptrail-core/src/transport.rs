//! Abstract sink for pipeline lifecycle events.

use async_trait::async_trait;

use crate::error::Result;
use crate::meta::{PipelineMeta, RunStatus, StepMeta};

/// Four lifecycle operations a pipeline drives against an external sink.
///
/// Implementations either return normally or raise a transport error;
/// callers do not retry, so any retry policy belongs inside the
/// implementation. Delivery is at-least-once: receivers must tolerate
/// duplicates.
#[async_trait]
pub trait Transport: Send + Sync {
    /// A run has started
    async fn initiate_run(&self, pipeline: &PipelineMeta) -> Result<()>;

    /// A run has terminated (or is being checkpointed while running)
    async fn finish_run(&self, pipeline: &PipelineMeta, status: RunStatus) -> Result<()>;

    /// A step in the run has started
    async fn initiate_step(&self, run_id: &str, step: &StepMeta) -> Result<()>;

    /// A step in the run has terminated
    async fn finish_step(&self, run_id: &str, step: &StepMeta) -> Result<()>;
}
