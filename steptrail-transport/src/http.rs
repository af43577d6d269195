//! HTTP transport: ships lifecycle events to an ingestion API.
//!
//! Two delivery modes. Non-batched issues one POST per operation and
//! surfaces failures to the caller. Batched (the default) appends events
//! to an in-memory FIFO drained by a periodic background flusher; a full
//! cache triggers an early flush, failed batches are retried with
//! doubling backoff and re-prepended so ordering survives, and a batch
//! that keeps failing is dropped with an operational error log instead of
//! surfacing to user code.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use steptrail_core::error::{Error, Result};
use steptrail_core::meta::{PipelineMeta, RunStatus, StepMeta};
use steptrail_core::transport::Transport;

use crate::HttpConfig;

const BATCH_PATH: &str = "api/ingestion/batch";
const PIPELINE_START_PATH: &str = "api/ingestion/pipeline/start";
const PIPELINE_FINISH_PATH: &str = "api/ingestion/pipeline/finish";
const STEP_START_PATH: &str = "api/ingestion/step/start";
const STEP_FINISH_PATH: &str = "api/ingestion/step/finish";

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportOptions {
    /// Base URL of the ingestion API
    pub base_url: String,
    /// Queue events and ship them in batches instead of one POST per call
    pub batch_logs: bool,
    /// How often the background flusher drains the queue
    pub flush_interval: Duration,
    /// Queue size that triggers an early flush
    pub max_batch_size: usize,
    /// Consecutive flush failures tolerated before a batch is dropped
    pub max_retries: u32,
    /// Initial wait between flush attempts, doubled per attempt
    pub retry_backoff: Duration,
    /// Verbose operational logging
    pub debug: bool,
}

impl HttpTransportOptions {
    /// Options with defaults: batching on, 5s flush interval, batches of
    /// 50, 3 retries starting at 500ms backoff.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            batch_logs: true,
            flush_interval: Duration::from_secs(5),
            max_batch_size: 50,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            debug: false,
        }
    }
}

/// One queued lifecycle event, in the shape the batch endpoint expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IngestionEvent {
    /// A run-level event
    Pipeline {
        /// `start` or `finish`
        operation: Operation,
        /// Run snapshot at event time
        meta: PipelineMeta,
        /// Terminal status, present on `finish` only
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<RunStatus>,
    },
    /// A step-level event
    Step {
        /// `start` or `finish`
        operation: Operation,
        /// Identity of the owning run
        #[serde(rename = "runId")]
        run_id: String,
        /// Step snapshot at event time
        step: StepMeta,
    },
}

/// Which end of the lifecycle an [`IngestionEvent`] marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// The run or step began
    Start,
    /// The run or step terminated
    Finish,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishRunRequest<'a> {
    pipeline_meta: &'a PipelineMeta,
    status: RunStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StepRequest<'a> {
    run_id: &'a str,
    step: &'a StepMeta,
}

#[derive(Default)]
#[derive(Debug)]
struct BatchState {
    cache: VecDeque<IngestionEvent>,
    flush_in_flight: bool,
    consecutive_failures: u32,
}

#[derive(Debug)]
struct TransportInner {
    client: reqwest::Client,
    base_url: Url,
    options: HttpTransportOptions,
    state: Mutex<BatchState>,
    shutdown: Notify,
}

/// Batching, buffering, retrying [`Transport`] over an HTTP ingestion API.
///
/// # Example
///
/// ```ignore
/// let transport = HttpTransport::new(HttpTransportOptions::new("http://localhost:3001/"))?;
/// // ... hand to a Pipeline, run it ...
/// transport.flush_and_stop().await;
/// ```
#[derive(Debug)]
pub struct HttpTransport {
    inner: Arc<TransportInner>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    /// Validate the options, build the HTTP client, and in batched mode
    /// start the periodic flusher.
    pub fn new(options: HttpTransportOptions) -> Result<Self> {
        let mut normalized = options.base_url.clone();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url = Url::parse(&normalized).map_err(|e| {
            Error::config(format!("invalid base_url '{}': {}", options.base_url, e))
        })?;
        let client = HttpConfig::default().build_client()?;

        let inner = Arc::new(TransportInner {
            client,
            base_url,
            options,
            state: Mutex::new(BatchState::default()),
            shutdown: Notify::new(),
        });

        let flusher = if inner.options.batch_logs {
            Some(Self::spawn_flusher(Arc::clone(&inner)))
        } else {
            None
        };

        Ok(Self {
            inner,
            flusher: Mutex::new(flusher),
        })
    }

    fn spawn_flusher(inner: Arc<TransportInner>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.options.flush_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = inner.shutdown.notified() => break,
                }
                inner.flush().await;
            }
        })
    }

    /// Number of events waiting in the batch cache
    pub fn pending_events(&self) -> usize {
        self.inner.state.lock().cache.len()
    }

    /// Drain the cache now. Serialized: a call that finds a flush already
    /// in flight returns immediately.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Stop the periodic flusher, perform one final flush, and wait for
    /// it to complete. Idempotent and safe to call multiple times.
    pub async fn flush_and_stop(&self) {
        let flusher = self.flusher.lock().take();
        if let Some(handle) = flusher {
            self.inner.shutdown.notify_one();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "batch flusher task failed");
            }
        }
        self.inner.flush().await;
    }

    /// Queue one event; a full cache triggers a non-blocking flush.
    fn enqueue(&self, event: IngestionEvent) {
        let should_flush = {
            let mut state = self.inner.state.lock();
            state.cache.push_back(event);
            state.cache.len() >= self.inner.options.max_batch_size
        };
        if should_flush {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.flush().await;
            });
        }
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        // A transport dropped without flush_and_stop abandons pending
        // events; the flusher must not outlive it.
        if let Some(handle) = self.flusher.lock().take() {
            handle.abort();
        }
    }
}

impl TransportInner {
    /// One flush cycle: take the cache, POST it, retry on failure with
    /// doubling backoff. The in-flight flag keeps at most one flush
    /// running; concurrent callers no-op.
    async fn flush(&self) {
        {
            let mut state = self.state.lock();
            if state.flush_in_flight || state.cache.is_empty() {
                return;
            }
            state.flush_in_flight = true;
        }

        let mut backoff = self.options.retry_backoff;
        loop {
            let batch: Vec<IngestionEvent> = {
                let mut state = self.state.lock();
                state.cache.drain(..).collect()
            };
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();

            match self.post(BATCH_PATH, &batch, "flush batch").await {
                Ok(()) => {
                    self.state.lock().consecutive_failures = 0;
                    if self.options.debug {
                        tracing::debug!(events = batch_len, "flushed batch");
                    }
                    break;
                }
                Err(e) => {
                    let failures = {
                        let mut state = self.state.lock();
                        // failed batch goes back in front of anything
                        // that arrived while it was in flight
                        for event in batch.into_iter().rev() {
                            state.cache.push_front(event);
                        }
                        state.consecutive_failures += 1;
                        state.consecutive_failures
                    };

                    if failures >= self.options.max_retries {
                        {
                            let mut state = self.state.lock();
                            let drop_len = batch_len.min(state.cache.len());
                            state.cache.drain(..drop_len);
                            state.consecutive_failures = 0;
                        }
                        tracing::error!(
                            dropped = batch_len,
                            retries = self.options.max_retries,
                            error = %e,
                            "dropping batch after repeated flush failures"
                        );
                        break;
                    }

                    tracing::warn!(attempt = failures, error = %e, "batch flush failed, will retry");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }

        self.state.lock().flush_in_flight = false;
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        operation: &str,
    ) -> Result<()> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| Error::config(format!("invalid endpoint path '{}': {}", path, e)))?;
        if self.options.debug {
            tracing::debug!(%url, operation, "posting ingestion payload");
        }
        let response = self.client.post(url).json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::transport(format!(
                "Failed to {}: {} {}",
                operation, status, text
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn initiate_run(&self, pipeline: &PipelineMeta) -> Result<()> {
        if self.inner.options.batch_logs {
            self.enqueue(IngestionEvent::Pipeline {
                operation: Operation::Start,
                meta: pipeline.clone(),
                status: None,
            });
            return Ok(());
        }
        self.inner
            .post(PIPELINE_START_PATH, pipeline, "initiate run")
            .await
    }

    async fn finish_run(&self, pipeline: &PipelineMeta, status: RunStatus) -> Result<()> {
        if self.inner.options.batch_logs {
            self.enqueue(IngestionEvent::Pipeline {
                operation: Operation::Finish,
                meta: pipeline.clone(),
                status: Some(status),
            });
            return Ok(());
        }
        let body = FinishRunRequest {
            pipeline_meta: pipeline,
            status,
        };
        self.inner
            .post(PIPELINE_FINISH_PATH, &body, "finish run")
            .await
    }

    async fn initiate_step(&self, run_id: &str, step: &StepMeta) -> Result<()> {
        if self.inner.options.batch_logs {
            self.enqueue(IngestionEvent::Step {
                operation: Operation::Start,
                run_id: run_id.to_string(),
                step: step.clone(),
            });
            return Ok(());
        }
        let body = StepRequest { run_id, step };
        self.inner
            .post(STEP_START_PATH, &body, "initiate step")
            .await
    }

    async fn finish_step(&self, run_id: &str, step: &StepMeta) -> Result<()> {
        if self.inner.options.batch_logs {
            self.enqueue(IngestionEvent::Step {
                operation: Operation::Finish,
                run_id: run_id.to_string(),
                step: step.clone(),
            });
            return Ok(());
        }
        let body = StepRequest { run_id, step };
        self.inner
            .post(STEP_FINISH_PATH, &body, "finish step")
            .await
    }
}
