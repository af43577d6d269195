//! Mock transport for testing

use async_trait::async_trait;
use parking_lot::Mutex;

use steptrail_core::error::{Error, Result};
use steptrail_core::meta::{PipelineMeta, RunStatus, StepMeta};
use steptrail_core::transport::Transport;

/// One recorded transport call with its payload.
#[derive(Debug, Clone)]
pub enum RecordedCall {
    /// `initiate_run` was called
    InitiateRun {
        /// Run snapshot the pipeline passed in
        pipeline: PipelineMeta,
    },
    /// `finish_run` was called
    FinishRun {
        /// Run snapshot the pipeline passed in
        pipeline: PipelineMeta,
        /// Reported status
        status: RunStatus,
    },
    /// `initiate_step` was called
    InitiateStep {
        /// Identity of the owning run
        run_id: String,
        /// Step snapshot the pipeline passed in
        step: StepMeta,
    },
    /// `finish_step` was called
    FinishStep {
        /// Identity of the owning run
        run_id: String,
        /// Step snapshot the pipeline passed in
        step: StepMeta,
    },
}

/// A [`Transport`] that records every call for inspection in tests.
///
/// Optionally fails all subsequent calls after [`MockTransport::fail_with`],
/// for exercising error-isolation paths.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<RecordedCall>>,
    fail_message: Mutex<Option<String>>,
}

impl MockTransport {
    /// Create a mock that accepts every call
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a transport error
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_message.lock() = Some(message.into());
    }

    /// All recorded calls, in arrival order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of `initiate_run` calls
    pub fn initiate_run_count(&self) -> usize {
        self.count(|c| matches!(c, RecordedCall::InitiateRun { .. }))
    }

    /// Number of `finish_run` calls
    pub fn finish_run_count(&self) -> usize {
        self.count(|c| matches!(c, RecordedCall::FinishRun { .. }))
    }

    /// Number of `initiate_step` calls
    pub fn initiate_step_count(&self) -> usize {
        self.count(|c| matches!(c, RecordedCall::InitiateStep { .. }))
    }

    /// Number of `finish_step` calls
    pub fn finish_step_count(&self) -> usize {
        self.count(|c| matches!(c, RecordedCall::FinishStep { .. }))
    }

    /// Payload of the most recent `finish_run` call
    pub fn last_finish_run(&self) -> Option<(PipelineMeta, RunStatus)> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            RecordedCall::FinishRun { pipeline, status } => {
                Some((pipeline.clone(), *status))
            }
            _ => None,
        })
    }

    fn count(&self, predicate: impl Fn(&RecordedCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|&call| predicate(call)).count()
    }

    fn accept(&self, call: RecordedCall) -> Result<()> {
        self.calls.lock().push(call);
        match self.fail_message.lock().as_ref() {
            Some(message) => Err(Error::transport(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn initiate_run(&self, pipeline: &PipelineMeta) -> Result<()> {
        self.accept(RecordedCall::InitiateRun {
            pipeline: pipeline.clone(),
        })
    }

    async fn finish_run(&self, pipeline: &PipelineMeta, status: RunStatus) -> Result<()> {
        self.accept(RecordedCall::FinishRun {
            pipeline: pipeline.clone(),
            status,
        })
    }

    async fn initiate_step(&self, run_id: &str, step: &StepMeta) -> Result<()> {
        self.accept(RecordedCall::InitiateStep {
            run_id: run_id.to_string(),
            step: step.clone(),
        })
    }

    async fn finish_step(&self, run_id: &str, step: &StepMeta) -> Result<()> {
        self.accept(RecordedCall::FinishStep {
            run_id: run_id.to_string(),
            step: step.clone(),
        })
    }
}
