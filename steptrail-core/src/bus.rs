//! Per-step event bus with parent-chain bubbling.
//!
//! Every step owns one [`EventBus`]. Listeners registered on a node see
//! events produced anywhere in that node's subtree: the emitting step
//! publishes to its own bus, then walks the parent chain publishing the
//! same event to each ancestor.
//!
//! Publication is fire-and-forget for the emitter. Each bus lazily spawns
//! a dispatcher task that drains a serial queue, so one node's listeners
//! run sequentially in registration order while the step itself keeps
//! going. A failing listener is logged and never blocks later listeners
//! or bubbling.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::meta::ErrorMeta;

/// The five lifecycle event names a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventName {
    /// A step began running
    StepStart,
    /// A step's function returned normally
    StepSuccess,
    /// A step's function raised
    StepError,
    /// A record was written on a step
    StepRecord,
    /// A step terminated, after success or error
    StepComplete,
}

impl EventName {
    /// Exact wire string of the event name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepStart => "step-start",
            Self::StepSuccess => "step-success",
            Self::StepError => "step-error",
            Self::StepRecord => "step-record",
            Self::StepComplete => "step-complete",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event. The key is always the originating step's key, so
/// bubbled listeners can tell where the event came from.
#[derive(Debug, Clone)]
pub enum StepEvent {
    /// `step-start(key)`
    Start {
        /// Originating step key
        key: String,
    },
    /// `step-success(key, result)`
    Success {
        /// Originating step key
        key: String,
        /// Serialized return value of the step function
        result: Value,
    },
    /// `step-error(key, error)`
    Error {
        /// Originating step key
        key: String,
        /// Captured error identity
        error: ErrorMeta,
    },
    /// `step-record(key, recordKey, value)`
    Record {
        /// Originating step key
        key: String,
        /// Record key written
        record_key: String,
        /// Record value written
        value: Value,
    },
    /// `step-complete(key)`
    Complete {
        /// Originating step key
        key: String,
    },
}

impl StepEvent {
    /// Key of the originating step
    pub fn key(&self) -> &str {
        match self {
            Self::Start { key }
            | Self::Success { key, .. }
            | Self::Error { key, .. }
            | Self::Record { key, .. }
            | Self::Complete { key } => key,
        }
    }

    /// Name this event dispatches under
    pub fn name(&self) -> EventName {
        match self {
            Self::Start { .. } => EventName::StepStart,
            Self::Success { .. } => EventName::StepSuccess,
            Self::Error { .. } => EventName::StepError,
            Self::Record { .. } => EventName::StepRecord,
            Self::Complete { .. } => EventName::StepComplete,
        }
    }
}

/// Contract implemented by listeners interested in step lifecycle events.
#[async_trait]
pub trait StepListener: Send + Sync {
    /// Handle one event. Errors are logged by the dispatcher and do not
    /// stop other listeners.
    async fn on_event(&self, event: &StepEvent) -> anyhow::Result<()>;
}

/// A closure-based listener
pub struct FnListener<F> {
    func: F,
}

impl<F> FnListener<F> {
    /// Wrap an async closure as a listener
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> StepListener for FnListener<F>
where
    F: Fn(StepEvent) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_event(&self, event: &StepEvent) -> anyhow::Result<()> {
        (self.func)(event.clone()).await
    }
}

/// Per-node subscription registry and serial dispatch queue.
pub(crate) struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    listeners: Mutex<HashMap<EventName, Vec<Arc<dyn StepListener>>>>,
    queue: Mutex<Option<mpsc::UnboundedSender<StepEvent>>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(HashMap::new()),
                queue: Mutex::new(None),
            }),
        }
    }

    /// Register a listener for one event name. Dispatch order is
    /// registration order.
    pub(crate) fn on(&self, event: EventName, listener: Arc<dyn StepListener>) {
        self.inner
            .listeners
            .lock()
            .entry(event)
            .or_default()
            .push(listener);
        self.ensure_dispatcher();
    }

    /// Enqueue an event for this node's listeners. Non-blocking; a node
    /// with no listeners has no queue and the event is discarded here.
    pub(crate) fn publish(&self, event: StepEvent) {
        if let Some(tx) = self.inner.queue.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Spawn the dispatcher on first registration. The task holds only a
    /// weak handle: dropping the owning step closes the queue and ends it.
    fn ensure_dispatcher(&self) {
        let mut queue = self.inner.queue.lock();
        if queue.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<StepEvent>();
        *queue = Some(tx);
        let bus = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let listeners = match bus.upgrade() {
                    Some(inner) => inner
                        .listeners
                        .lock()
                        .get(&event.name())
                        .cloned()
                        .unwrap_or_default(),
                    None => break,
                };
                for listener in listeners {
                    if let Err(e) = listener.on_event(&event).await {
                        tracing::error!(event = %event.name(), key = %event.key(), error = %e, "step listener failed");
                    }
                }
            }
        });
    }
}
