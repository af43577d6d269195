//! The root of a traced run.
//!
//! A [`Pipeline`] is a root [`Step`] carrying a run id and, optionally, a
//! [`Transport`] that receives lifecycle events: per step in real time,
//! or the whole tree as one payload when the run finishes.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::{EventName, StepEvent, StepListener};
use crate::error::{Error, Result};
use crate::meta::{PipelineMeta, RunStatus, LOG_VERSION};
use crate::step::{Step, WeakStep};
use crate::transport::Transport;

/// When (if ever) the pipeline pushes lifecycle events to its transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoSave {
    /// No transport calls
    #[default]
    Off,
    /// One `finish_run` with the full step tree when the run terminates
    Finish,
    /// `initiate_run`/`finish_run` around the run plus per-step
    /// `initiate_step`/`finish_step` as events arrive
    RealTime,
}

/// Configuration for a [`Pipeline`]. A small closed set, so it is a typed
/// record rather than a free-form map.
#[derive(Clone, Default)]
pub struct PipelineOptions {
    /// Explicit run id; a fresh UUID is generated when absent
    pub run_id: Option<String>,
    /// Auto-save mode
    pub auto_save: AutoSave,
    /// Event sink; required unless `auto_save` is `Off`
    pub transport: Option<Arc<dyn Transport>>,
}

/// The root step of a run.
///
/// Dereferences to [`Step`], so `step`, `record`, `on` and the output
/// methods are available directly on the pipeline.
pub struct Pipeline {
    root: Step,
    run_id: String,
    auto_save: AutoSave,
    transport: Option<Arc<dyn Transport>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("run_id", &self.run_id)
            .field("auto_save", &self.auto_save)
            .finish()
    }
}

impl Deref for Pipeline {
    type Target = Step;

    fn deref(&self) -> &Step {
        &self.root
    }
}

impl Pipeline {
    /// Create a pipeline with default options (no auto-save)
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            root: Step::new(name),
            run_id: Uuid::new_v4().to_string(),
            auto_save: AutoSave::Off,
            transport: None,
        }
    }

    /// Create a pipeline from explicit options.
    ///
    /// Fails with a configuration error when an auto-save mode is set
    /// without a transport.
    pub fn with_options(name: impl Into<String>, options: PipelineOptions) -> Result<Self> {
        if options.auto_save != AutoSave::Off && options.transport.is_none() {
            return Err(Error::config(
                "transport must be provided when auto_save is enabled",
            ));
        }

        let pipeline = Self {
            root: Step::new(name),
            run_id: options
                .run_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            auto_save: options.auto_save,
            transport: options.transport,
        };

        if pipeline.auto_save == AutoSave::RealTime {
            if let Some(transport) = &pipeline.transport {
                let forwarder = Arc::new(TransportForwarder {
                    run_id: pipeline.run_id.clone(),
                    transport: Arc::clone(transport),
                    root: pipeline.root.downgrade(),
                });
                pipeline
                    .root
                    .subscribe(EventName::StepStart, Arc::clone(&forwarder) as _);
                pipeline.root.subscribe(EventName::StepComplete, forwarder);
            }
        }

        Ok(pipeline)
    }

    /// Identity of this run, immutable after construction
    pub fn get_run_id(&self) -> &str {
        &self.run_id
    }

    /// Run `f` as the body of this pipeline.
    ///
    /// The pipeline's own timing and lifecycle events behave exactly like
    /// a step's. Returns the root step handle on success; a failure
    /// propagates after the tree and the transport have been notified.
    /// Transport failures are logged and never fail the run.
    #[tracing::instrument(skip(self, f), fields(pipeline = %self.get_name(), run_id = %self.run_id))]
    pub async fn track<F, Fut, T>(&self, f: F) -> Result<Step>
    where
        F: FnOnce(Step) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
        T: Serialize,
    {
        if self.auto_save == AutoSave::RealTime {
            if let Some(transport) = &self.transport {
                if let Err(e) = transport.initiate_run(&self.output_pipeline_meta()).await {
                    tracing::error!(error = %e, "failed to initiate run");
                }
            }
        }

        let outcome = self.root.track(f).await;
        let status = match &outcome {
            Ok(_) => RunStatus::Completed,
            Err(_) => RunStatus::Failed,
        };
        tracing::info!(status = %status, "pipeline finished");

        if self.auto_save != AutoSave::Off {
            if let Some(transport) = &self.transport {
                if let Err(e) = transport
                    .finish_run(&self.output_pipeline_meta(), status)
                    .await
                {
                    tracing::error!(error = %e, "failed to finish run");
                }
            }
        }

        outcome
    }

    /// Snapshot of the whole run: root metadata, log version, run id, and
    /// the pre-order flattening of the step tree.
    pub fn output_pipeline_meta(&self) -> PipelineMeta {
        PipelineMeta {
            step: self.root.get_step_meta(),
            log_version: LOG_VERSION,
            run_id: self.run_id.clone(),
            steps: self.root.output_flattened(),
        }
    }
}

/// Real-time listener: turns bubbled `step-start`/`step-complete` events
/// into `initiate_step`/`finish_step` transport calls. Holds the tree
/// weakly so a dropped pipeline is not kept alive by its own listener.
struct TransportForwarder {
    run_id: String,
    transport: Arc<dyn Transport>,
    root: WeakStep,
}

#[async_trait]
impl StepListener for TransportForwarder {
    async fn on_event(&self, event: &StepEvent) -> anyhow::Result<()> {
        let Some(root) = self.root.upgrade() else {
            return Ok(());
        };
        let Some(step) = root.find_by_key(event.key()) else {
            return Ok(());
        };
        match event {
            StepEvent::Start { .. } => {
                self.transport
                    .initiate_step(&self.run_id, &step.get_step_meta())
                    .await?;
            }
            StepEvent::Complete { .. } => {
                self.transport
                    .finish_step(&self.run_id, &step.get_step_meta())
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_generated_when_absent() {
        let pipeline = Pipeline::new("pipe");
        assert!(!pipeline.get_run_id().is_empty());
        assert!(Uuid::parse_str(pipeline.get_run_id()).is_ok());
    }

    #[test]
    fn test_custom_run_id_is_kept() {
        let pipeline = Pipeline::with_options(
            "pipe",
            PipelineOptions {
                run_id: Some("custom-run-id".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(pipeline.get_run_id(), "custom-run-id");
    }

    #[test]
    fn test_auto_save_requires_transport() {
        let err = Pipeline::with_options(
            "pipe",
            PipelineOptions {
                auto_save: AutoSave::RealTime,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("transport must be provided"));
    }

    #[test]
    fn test_auto_save_wire_form() {
        assert_eq!(
            serde_json::to_value(AutoSave::RealTime).unwrap(),
            serde_json::json!("real_time")
        );
        assert_eq!(
            serde_json::to_value(AutoSave::Off).unwrap(),
            serde_json::json!("off")
        );
    }

    #[test]
    fn test_output_pipeline_meta_shape() {
        let pipeline = Pipeline::new("pipe");
        let meta = pipeline.output_pipeline_meta();
        assert_eq!(meta.run_id, pipeline.get_run_id());
        assert_eq!(meta.log_version, LOG_VERSION);
        assert_eq!(meta.step.name, "pipe");
        assert_eq!(meta.step.key, "pipe");
        assert_eq!(meta.steps.len(), 1);
    }
}
