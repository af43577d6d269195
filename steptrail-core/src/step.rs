//! The execution tree: named steps wrapping arbitrary async work.
//!
//! A [`Step`] is a cheap clone-able handle over the shared node state, so
//! user closures receive their own handle and parallel branches mutate
//! their own nodes without contention. The tree owns its children
//! top-down; the back-reference from child to parent is weak and exists
//! only for event bubbling and key composition.

use std::future::Future;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::bus::{EventBus, EventName, StepEvent, StepListener};
use crate::error::{Error, Result};
use crate::meta::{now_ms, ErrorMeta, NestedStepMeta, StepMeta, TimeMeta};

/// Lifecycle state of a step. Transitions are monotonic:
/// created -> running -> succeeded | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Constructed, not yet running
    Created,
    /// The step function is executing
    Running,
    /// The step function returned normally
    Succeeded,
    /// The step function raised
    Failed,
}

struct StepState {
    status: StepStatus,
    children: Vec<Step>,
    records: IndexMap<String, Value>,
    time: TimeMeta,
    result: Option<Value>,
    error: Option<ErrorMeta>,
}

pub(crate) struct StepInner {
    name: String,
    key: String,
    parent: Option<Weak<StepInner>>,
    bus: EventBus,
    state: Mutex<StepState>,
}

/// A named node in the execution tree.
///
/// # Example
///
/// ```ignore
/// let root = Step::new("ingest");
/// root.track(|st| async move {
///     let pages = st.step("fetch", |st| async move {
///         st.record("source", "crawler")?;
///         Ok(vec!["page_1", "page_2"])
///     }).await?;
///     Ok(pages.len())
/// }).await?;
/// ```
#[derive(Clone)]
pub struct Step {
    inner: Arc<StepInner>,
}

/// Non-owning handle to a step, used where holding a [`Step`] would keep
/// the tree alive (e.g. listeners registered on the tree itself).
#[derive(Clone)]
pub(crate) struct WeakStep {
    inner: Weak<StepInner>,
}

impl WeakStep {
    pub(crate) fn upgrade(&self) -> Option<Step> {
        self.inner.upgrade().map(|inner| Step { inner })
    }
}

impl Step {
    /// Create a root step whose key defaults to its name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let key = name.clone();
        Self::build(name, key, None)
    }

    /// Create a root step with an explicit key override
    pub fn with_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self::build(name.into(), key.into(), None)
    }

    fn build(name: String, key: String, parent: Option<Weak<StepInner>>) -> Self {
        Self {
            inner: Arc::new(StepInner {
                name,
                key,
                parent,
                bus: EventBus::new(),
                state: Mutex::new(StepState {
                    status: StepStatus::Created,
                    children: Vec::new(),
                    records: IndexMap::new(),
                    time: TimeMeta::default(),
                    result: None,
                    error: None,
                }),
            }),
        }
    }

    /// Create a child node and append it to `children`. Insertion order
    /// reflects the order `step(...)` calls were entered.
    fn child(&self, name: String) -> Step {
        let key = format!("{}.{}", self.inner.key, name);
        let child = Self::build(name, key, Some(Arc::downgrade(&self.inner)));
        self.inner.state.lock().children.push(child.clone());
        child
    }

    /// Run `f` as a new child step.
    ///
    /// The child is created immediately, timed around the invocation, and
    /// stays in the tree whether `f` succeeds or fails. The return value
    /// is serialized into the child's metadata and handed back unchanged;
    /// an error is captured as `{name, message}` and propagated.
    pub async fn step<F, Fut, T>(&self, name: impl Into<String>, f: F) -> Result<T>
    where
        F: FnOnce(Step) -> Fut,
        Fut: Future<Output = Result<T>>,
        T: Serialize,
    {
        let child = self.child(name.into());
        child.run(f).await
    }

    /// Run `f` against this step itself, measuring its own timing and
    /// emitting its own lifecycle events. Returns the handle on success;
    /// on failure the error propagates and the step is still fully
    /// populated.
    pub async fn track<F, Fut, T>(&self, f: F) -> Result<Step>
    where
        F: FnOnce(Step) -> Fut,
        Fut: Future<Output = Result<T>>,
        T: Serialize,
    {
        self.run(f).await?;
        Ok(self.clone())
    }

    async fn run<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Step) -> Fut,
        Fut: Future<Output = Result<T>>,
        T: Serialize,
    {
        {
            let mut state = self.inner.state.lock();
            state.time.start_ts = Some(now_ms());
            state.status = StepStatus::Running;
        }
        tracing::debug!(key = %self.inner.key, "step started");
        self.emit(StepEvent::Start {
            key: self.inner.key.clone(),
        });

        match f(self.clone()).await {
            Ok(value) => {
                let result = match serde_json::to_value(&value) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(key = %self.inner.key, error = %e, "step result is not JSON-serializable, recording null");
                        Value::Null
                    }
                };
                self.finish(StepStatus::Succeeded, Some(result.clone()), None);
                self.emit(StepEvent::Success {
                    key: self.inner.key.clone(),
                    result,
                });
                self.emit(StepEvent::Complete {
                    key: self.inner.key.clone(),
                });
                Ok(value)
            }
            Err(err) => {
                let error = ErrorMeta::from(&err);
                self.finish(StepStatus::Failed, None, Some(error.clone()));
                tracing::debug!(key = %self.inner.key, error = %error.message, "step failed");
                self.emit(StepEvent::Error {
                    key: self.inner.key.clone(),
                    error,
                });
                self.emit(StepEvent::Complete {
                    key: self.inner.key.clone(),
                });
                Err(err)
            }
        }
    }

    /// Close out timing and store the terminal outcome. `end_ts` is
    /// clamped to `start_ts` so `time_usage_ms` is never negative.
    fn finish(&self, status: StepStatus, result: Option<Value>, error: Option<ErrorMeta>) {
        let mut state = self.inner.state.lock();
        let start = state.time.start_ts.unwrap_or_else(now_ms);
        let end = now_ms().max(start);
        state.time.end_ts = Some(end);
        state.time.time_usage_ms = Some(end - start);
        state.result = result;
        state.error = error;
        state.status = status;
    }

    /// Insert or overwrite a record on this step and emit `step-record`.
    ///
    /// Writing to an already-terminated step is permitted (late
    /// listener-driven writes) and logs a warning.
    pub fn record(&self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        let record_key = key.into();
        let value = serde_json::to_value(value).map_err(Error::from)?;
        {
            let mut state = self.inner.state.lock();
            if matches!(state.status, StepStatus::Succeeded | StepStatus::Failed) {
                tracing::warn!(key = %self.inner.key, record = %record_key, "record written to a completed step");
            }
            state.records.insert(record_key.clone(), value.clone());
        }
        self.emit(StepEvent::Record {
            key: self.inner.key.clone(),
            record_key,
            value,
        });
        Ok(())
    }

    /// Register a listener on this node. By bubbling, it sees events from
    /// this node's entire subtree.
    pub fn on(&self, event: EventName, listener: impl StepListener + 'static) {
        self.subscribe(event, Arc::new(listener));
    }

    pub(crate) fn subscribe(&self, event: EventName, listener: Arc<dyn StepListener>) {
        self.inner.bus.on(event, listener);
    }

    /// Publish on this node's bus, then bubble the same event up the
    /// parent chain.
    fn emit(&self, event: StepEvent) {
        self.inner.bus.publish(event.clone());
        let mut parent = self.inner.parent.as_ref().and_then(Weak::upgrade);
        while let Some(node) = parent {
            node.bus.publish(event.clone());
            parent = node.parent.as_ref().and_then(Weak::upgrade);
        }
    }

    /// Local label of the step
    pub fn get_name(&self) -> &str {
        &self.inner.name
    }

    /// Dot-joined path from the root
    pub fn get_key(&self) -> &str {
        &self.inner.key
    }

    /// Current lifecycle state
    pub fn status(&self) -> StepStatus {
        self.inner.state.lock().status
    }

    /// Snapshot of the records map, in insertion order
    pub fn get_records(&self) -> IndexMap<String, Value> {
        self.inner.state.lock().records.clone()
    }

    /// Snapshot of this step's metadata (children excluded)
    pub fn get_step_meta(&self) -> StepMeta {
        let state = self.inner.state.lock();
        StepMeta {
            name: self.inner.name.clone(),
            key: self.inner.key.clone(),
            time: state.time.clone(),
            records: state.records.clone(),
            result: state.result.clone(),
            error: state.error.clone(),
        }
    }

    fn children(&self) -> Vec<Step> {
        self.inner.state.lock().children.clone()
    }

    /// Materialize the subtree as a recursive value
    pub fn output_nested(&self) -> NestedStepMeta {
        NestedStepMeta {
            meta: self.get_step_meta(),
            substeps: self
                .children()
                .iter()
                .map(Step::output_nested)
                .collect(),
        }
    }

    /// Pre-order flattening: self first, then each child's flattening in
    /// insertion order.
    pub fn output_flattened(&self) -> Vec<StepMeta> {
        let mut steps = vec![self.get_step_meta()];
        for child in self.children() {
            steps.extend(child.output_flattened());
        }
        steps
    }

    /// First pre-order match for a key. Keys are not unique; duplicate
    /// names resolve to the earliest-entered step.
    pub(crate) fn find_by_key(&self, key: &str) -> Option<Step> {
        if self.inner.key == key {
            return Some(self.clone());
        }
        self.children()
            .iter()
            .find_map(|child| child.find_by_key(key))
    }

    pub(crate) fn downgrade(&self) -> WeakStep {
        WeakStep {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.inner.name)
            .field("key", &self.inner.key)
            .field("status", &self.status())
            .finish()
    }
}
