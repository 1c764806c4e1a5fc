//! Run records.
//!
//! A run is one execution of a workflow. Nothing in memory is authoritative
//! about it; the record here is a snapshot maintained by the event log, which
//! applies run-level events (`run_started`, `run_completed`, ...) to it as
//! they are appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::id::RunId;
use crate::name::WorkflowName;

/// Spec version written for newly created runs. Version 1 runs carry legacy
/// non-prefixed payloads; version 2 and later require the 4-byte format tag.
pub const CURRENT_SPEC_VERSION: u32 = 2;

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet picked up by the workflow handler.
    Pending,

    /// At least one replay pass has started; the run may be suspended.
    Running,

    /// Workflow returned; `output` is set.
    Completed,

    /// Workflow threw; `error` is set.
    Failed,

    /// Cancelled by the caller.
    Cancelled,
}

impl RunStatus {
    /// Whether this status admits no further events.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One execution of a workflow.
///
/// Timestamp fields are defined per state: `pending` has neither
/// `started_at` nor `completed_at`; `running` has `started_at` only; any
/// terminal status has both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    /// Run identifier (`wrun_<ulid>`).
    pub run_id: RunId,

    /// Fully-qualified name of the workflow being executed.
    pub workflow_name: WorkflowName,

    /// Lifecycle status.
    pub status: RunStatus,

    /// When `start()` created the run.
    pub created_at: DateTime<Utc>,

    /// When the first `run_started` event was appended.
    pub started_at: Option<DateTime<Utc>>,

    /// When a terminal event was appended.
    pub completed_at: Option<DateTime<Utc>>,

    /// When the run's data becomes eligible for deletion.
    pub expired_at: Option<DateTime<Utc>>,

    /// Serialized workflow arguments (format-prefixed).
    #[serde(with = "crate::serde_bytes")]
    pub input: Vec<u8>,

    /// Serialized return value (format-prefixed), set on completion.
    #[serde(default, with = "crate::serde_bytes::option")]
    pub output: Option<Vec<u8>>,

    /// Failure recorded by `run_failed`.
    pub error: Option<WorkflowError>,

    /// Opaque host metadata; includes a `runtimeVersion` string.
    pub execution_context: serde_json::Value,

    /// Payload format version for this run's data at rest.
    pub spec_version: u32,
}

impl Run {
    /// Creates a pending run record.
    pub fn new(run_id: RunId, workflow_name: WorkflowName, input: Vec<u8>) -> Self {
        Self {
            run_id,
            workflow_name,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expired_at: None,
            input,
            output: None,
            error: None,
            execution_context: serde_json::json!({
                "runtimeVersion": concat!("windlass/", env!("CARGO_PKG_VERSION")),
            }),
            spec_version: CURRENT_SPEC_VERSION,
        }
    }

    /// Attach host execution context (merged over the default).
    pub fn with_execution_context(mut self, context: serde_json::Value) -> Self {
        let base = std::mem::take(&mut self.execution_context);
        self.execution_context = match (base, context) {
            (serde_json::Value::Object(mut base), serde_json::Value::Object(extra)) => {
                for (k, v) in extra {
                    base.insert(k, v);
                }
                serde_json::Value::Object(base)
            }
            (_, context) => context,
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> Run {
        Run::new(
            RunId::new(),
            WorkflowName::new("./flows.ts", "addTen"),
            b"devl123".to_vec(),
        )
    }

    #[test]
    fn new_run_is_pending() {
        let run = sample_run();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.started_at.is_none());
        assert!(run.completed_at.is_none());
        assert_eq!(run.spec_version, CURRENT_SPEC_VERSION);
    }

    #[test]
    fn execution_context_carries_runtime_version() {
        let run = sample_run();
        let version = run.execution_context["runtimeVersion"]
            .as_str()
            .expect("runtimeVersion set");
        assert!(version.starts_with("windlass/"));
    }

    #[test]
    fn execution_context_merge_keeps_runtime_version() {
        let run = sample_run().with_execution_context(serde_json::json!({"region": "iad1"}));
        assert_eq!(run.execution_context["region"], "iad1");
        assert!(run.execution_context["runtimeVersion"].is_string());
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn run_serde_roundtrip() {
        let run = sample_run();
        let json = serde_json::to_string(&run).expect("serialize");
        let parsed: Run = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, run);
    }
}
