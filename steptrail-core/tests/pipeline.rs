use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use steptrail_core::bus::{EventName, FnListener, StepEvent};
use steptrail_core::error::Result;
use steptrail_core::meta::{PipelineMeta, RunStatus, StepMeta};
use steptrail_core::pipeline::{AutoSave, Pipeline, PipelineOptions};
use steptrail_core::transport::Transport;

/// Test double recording every transport call in arrival order.
#[derive(Default)]
struct RecordingTransport {
    initiate_runs: Mutex<Vec<PipelineMeta>>,
    finish_runs: Mutex<Vec<(PipelineMeta, RunStatus)>>,
    initiate_steps: Mutex<Vec<(String, StepMeta)>>,
    finish_steps: Mutex<Vec<(String, StepMeta)>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn initiate_run(&self, pipeline: &PipelineMeta) -> Result<()> {
        self.initiate_runs.lock().push(pipeline.clone());
        Ok(())
    }

    async fn finish_run(&self, pipeline: &PipelineMeta, status: RunStatus) -> Result<()> {
        self.finish_runs.lock().push((pipeline.clone(), status));
        Ok(())
    }

    async fn initiate_step(&self, run_id: &str, step: &StepMeta) -> Result<()> {
        self.initiate_steps.lock().push((run_id.to_string(), step.clone()));
        Ok(())
    }

    async fn finish_step(&self, run_id: &str, step: &StepMeta) -> Result<()> {
        self.finish_steps.lock().push((run_id.to_string(), step.clone()));
        Ok(())
    }
}

fn with_transport(auto_save: AutoSave) -> (Pipeline, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let pipeline = Pipeline::with_options(
        "test-pipeline",
        PipelineOptions {
            auto_save,
            transport: Some(Arc::clone(&transport) as Arc<dyn Transport>),
            ..Default::default()
        },
    )
    .unwrap();
    (pipeline, transport)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_track_single_step() {
    let pipeline = Pipeline::new("pipe");
    let tracked = pipeline
        .track(|st| async move { st.step("a", |_st| async move { Ok("ra") }).await })
        .await
        .unwrap();

    assert_eq!(tracked.get_key(), pipeline.get_key());

    let flattened = pipeline.output_flattened();
    assert_eq!(flattened.len(), 2);
    let names: Vec<&str> = flattened.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["pipe", "a"]);
    assert_eq!(flattened[1].result, Some(json!("ra")));
}

#[tokio::test]
async fn test_track_propagates_step_errors() {
    let pipeline = Pipeline::new("test-pipeline");
    let err = pipeline
        .track(|st| async move {
            st.step("step1", |_st| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Err::<(), _>(anyhow::anyhow!("test error").into())
            })
            .await
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "test error");
}

#[tokio::test]
async fn test_auto_save_finish_sends_one_payload() {
    let (pipeline, transport) = with_transport(AutoSave::Finish);

    pipeline
        .track(|st| async move {
            st.step("step1", |_st| async move { Ok("result1") }).await?;
            st.step("step2", |_st| async move { Ok("result2") }).await?;
            Ok("final-result")
        })
        .await
        .unwrap();
    settle().await;

    assert_eq!(transport.initiate_runs.lock().len(), 0);
    assert_eq!(transport.initiate_steps.lock().len(), 0);
    assert_eq!(transport.finish_steps.lock().len(), 0);

    let finish_runs = transport.finish_runs.lock();
    assert_eq!(finish_runs.len(), 1);
    let (meta, status) = &finish_runs[0];
    assert_eq!(*status, RunStatus::Completed);
    // the receiver reconstructs the whole run from one payload
    assert_eq!(meta.steps.len(), 3);
    let names: Vec<&str> = meta.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["test-pipeline", "step1", "step2"]);
}

#[tokio::test]
async fn test_auto_save_real_time_forwards_each_step() {
    let (pipeline, transport) = with_transport(AutoSave::RealTime);

    pipeline
        .track(|st| async move {
            st.step("step1", |_st| async move { Ok("result1") }).await
        })
        .await
        .unwrap();
    settle().await;

    let initiate_runs = transport.initiate_runs.lock();
    assert_eq!(initiate_runs.len(), 1);
    assert_eq!(initiate_runs[0].run_id, pipeline.get_run_id());
    assert_eq!(initiate_runs[0].step.name, "test-pipeline");

    // one for the pipeline itself, one for step1
    assert_eq!(transport.initiate_steps.lock().len(), 2);
    assert_eq!(transport.finish_steps.lock().len(), 2);

    let finish_runs = transport.finish_runs.lock();
    assert_eq!(finish_runs.len(), 1);
    assert_eq!(finish_runs[0].0.run_id, pipeline.get_run_id());
    assert_eq!(finish_runs[0].1, RunStatus::Completed);
}

#[tokio::test]
async fn test_auto_save_real_time_marks_failed_run() {
    let (pipeline, transport) = with_transport(AutoSave::RealTime);

    let err = pipeline
        .track(|st| async move {
            st.step("step1", |_st| async move {
                Err::<(), _>(anyhow::anyhow!("test error").into())
            })
            .await
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "test error");
    settle().await;

    let finish_runs = transport.finish_runs.lock();
    assert_eq!(finish_runs.len(), 1);
    assert_eq!(finish_runs[0].1, RunStatus::Failed);
}

#[tokio::test]
async fn test_failing_transport_does_not_fail_the_run() {
    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn initiate_run(&self, _pipeline: &PipelineMeta) -> Result<()> {
            Err(steptrail_core::Error::transport("endpoint down"))
        }
        async fn finish_run(&self, _pipeline: &PipelineMeta, _status: RunStatus) -> Result<()> {
            Err(steptrail_core::Error::transport("endpoint down"))
        }
        async fn initiate_step(&self, _run_id: &str, _step: &StepMeta) -> Result<()> {
            Err(steptrail_core::Error::transport("endpoint down"))
        }
        async fn finish_step(&self, _run_id: &str, _step: &StepMeta) -> Result<()> {
            Err(steptrail_core::Error::transport("endpoint down"))
        }
    }

    let pipeline = Pipeline::with_options(
        "test-pipeline",
        PipelineOptions {
            auto_save: AutoSave::RealTime,
            transport: Some(Arc::new(FailingTransport)),
            ..Default::default()
        },
    )
    .unwrap();

    let tracked = pipeline
        .track(|st| async move {
            st.step("step1", |_st| async move { Ok("result1") }).await
        })
        .await
        .unwrap();
    settle().await;

    // the tree is intact even though every transport call failed
    assert_eq!(tracked.output_flattened().len(), 2);
    assert_eq!(
        tracked.output_flattened()[1].result,
        Some(json!("result1"))
    );
}

#[tokio::test]
async fn test_pipeline_inherits_step_surface() {
    let pipeline = Pipeline::new("test-pipeline");
    pipeline.record("test-key", "test-value").unwrap();
    assert_eq!(pipeline.get_records()["test-key"], json!("test-value"));

    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    pipeline.on(
        EventName::StepRecord,
        FnListener::new(move |event: StepEvent| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(event);
                Ok(())
            }
        }),
    );
    pipeline.record("another-key", "another-value").unwrap();
    settle().await;

    let log = log.lock();
    assert_eq!(log.len(), 1);
    match &log[0] {
        StepEvent::Record { key, record_key, value } => {
            assert_eq!(key, pipeline.get_key());
            assert_eq!(record_key, "another-key");
            assert_eq!(value, &json!("another-value"));
        }
        other => panic!("expected record event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_output_pipeline_meta_includes_all_steps() {
    let pipeline = Pipeline::new("test-pipeline");
    pipeline
        .track(|st| async move {
            st.step("step1", |_st| async move { Ok("result1") }).await?;
            st.step("step2", |_st| async move { Ok("result2") }).await?;
            Ok("final-result")
        })
        .await
        .unwrap();

    let meta = pipeline.output_pipeline_meta();
    assert_eq!(meta.run_id, pipeline.get_run_id());
    assert_eq!(meta.log_version, 1);
    assert_eq!(meta.step.key, "test-pipeline");
    assert_eq!(meta.steps.len(), 3);
    assert_eq!(meta.steps[0].name, "test-pipeline");

    // wire form carries the camelCase aliases
    let value = serde_json::to_value(&meta).unwrap();
    assert_eq!(value["logVersion"], json!(1));
    assert_eq!(value["runId"], json!(pipeline.get_run_id()));
}
