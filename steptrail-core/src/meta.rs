//! Metadata value records emitted by the step tree.
//!
//! Everything here is an immutable-on-emit snapshot: steps hand out clones
//! of their current state, never live references. All types serialize with
//! the camelCase field aliases used on the wire (`startTs`, `runId`,
//! `logVersion`, ...) and ignore unknown fields when read back.

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Version of the serialized pipeline log format.
pub const LOG_VERSION: u32 = 1;

/// Millisecond wall-clock timestamp. Both endpoints of a step are taken
/// from this one source.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Timing of a single step, in milliseconds since epoch.
///
/// `start_ts` is set when the step begins running; `end_ts` and
/// `time_usage_ms` are set together when it terminates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeMeta {
    /// When the step started running
    pub start_ts: Option<i64>,
    /// When the step terminated
    pub end_ts: Option<i64>,
    /// `end_ts - start_ts`
    pub time_usage_ms: Option<i64>,
}

/// Identity of an error captured on a failed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMeta {
    /// Error kind, e.g. `ValidationError` or `Error` for user errors
    pub name: String,
    /// Human-readable message
    pub message: String,
}

impl From<&Error> for ErrorMeta {
    fn from(err: &Error) -> Self {
        Self {
            name: err.name().to_string(),
            message: err.to_string(),
        }
    }
}

/// Snapshot of a single step: label, dot-joined path, timing, records,
/// and the result or error of a terminated step (never both).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMeta {
    /// Local label of the step
    pub name: String,
    /// Dot-joined path from the root; not guaranteed unique
    pub key: String,
    /// Timing of the step
    pub time: TimeMeta,
    /// User-supplied key/value records, in insertion order
    pub records: IndexMap<String, Value>,
    /// Return value of a succeeded step
    pub result: Option<Value>,
    /// Captured error of a failed step
    pub error: Option<ErrorMeta>,
}

/// A step snapshot together with its recursively materialized children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedStepMeta {
    /// The step's own snapshot
    #[serde(flatten)]
    pub meta: StepMeta,
    /// Children in the order their `step(...)` call was entered
    pub substeps: Vec<NestedStepMeta>,
}

/// Snapshot of a whole pipeline run: the root step's own metadata plus the
/// run identity and the pre-order flattening of the full tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMeta {
    /// The root step's own snapshot
    #[serde(flatten)]
    pub step: StepMeta,
    /// Version of the log format
    #[serde(default = "default_log_version")]
    pub log_version: u32,
    /// Identity of the run
    pub run_id: String,
    /// Pre-order flattening of the step tree; the pipeline itself is index 0
    #[serde(default)]
    pub steps: Vec<StepMeta>,
}

fn default_log_version() -> u32 {
    LOG_VERSION
}

/// Terminal (or in-flight) status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// The tracked function returned normally
    Completed,
    /// The tracked function raised
    Failed,
    /// The run has started but not yet terminated
    Running,
}

impl RunStatus {
    /// Wire form of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Running => "running",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_step_meta() -> StepMeta {
        StepMeta {
            name: "parse".to_string(),
            key: "pipe.parse".to_string(),
            time: TimeMeta {
                start_ts: Some(1_000_000_000_000),
                end_ts: Some(1_000_000_000_500),
                time_usage_ms: Some(500),
            },
            records: IndexMap::new(),
            result: Some(json!("ok")),
            error: None,
        }
    }

    #[test]
    fn test_time_meta_camel_case_aliases() {
        let meta = sample_step_meta();
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["time"]["startTs"], json!(1_000_000_000_000i64));
        assert_eq!(value["time"]["endTs"], json!(1_000_000_000_500i64));
        assert_eq!(value["time"]["timeUsageMs"], json!(500));
    }

    #[test]
    fn test_pipeline_meta_flattens_step_fields() {
        let pipeline = PipelineMeta {
            step: sample_step_meta(),
            log_version: LOG_VERSION,
            run_id: "run-1".to_string(),
            steps: vec![sample_step_meta()],
        };
        let value = serde_json::to_value(&pipeline).unwrap();
        assert_eq!(value["name"], json!("parse"));
        assert_eq!(value["logVersion"], json!(1));
        assert_eq!(value["runId"], json!("run-1"));
        assert_eq!(value["steps"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn test_reader_ignores_unknown_fields() {
        let raw = json!({
            "name": "parse",
            "key": "pipe.parse",
            "time": { "startTs": 1, "endTs": 2, "timeUsageMs": 1, "futureField": true },
            "records": {},
            "result": null,
            "error": null,
            "futureField": "ignored",
        });
        let meta: StepMeta = serde_json::from_value(raw).unwrap();
        assert_eq!(meta.name, "parse");
        assert_eq!(meta.time.time_usage_ms, Some(1));
    }

    #[test]
    fn test_records_preserve_insertion_order() {
        let mut meta = sample_step_meta();
        meta.records.insert("zebra".to_string(), json!(1));
        meta.records.insert("alpha".to_string(), json!(2));
        meta.records.insert("zebra".to_string(), json!(3));
        let keys: Vec<&String> = meta.records.keys().collect();
        assert_eq!(keys, ["zebra", "alpha"]);
        assert_eq!(meta.records["zebra"], json!(3));
    }

    #[test]
    fn test_run_status_wire_form() {
        assert_eq!(serde_json::to_value(RunStatus::Completed).unwrap(), json!("completed"));
        assert_eq!(serde_json::to_value(RunStatus::Failed).unwrap(), json!("failed"));
        assert_eq!(RunStatus::Running.to_string(), "running");
    }
}
