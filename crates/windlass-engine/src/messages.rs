//! Queue message payloads.
//!
//! Workflow messages are keyed by run id, step messages by correlation id.
//! The health probe is recognized on both topics before any payload parsing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use windlass_core::{CorrelationId, RunId, StepName};

use crate::health::HEALTH_FIELD;

/// Payload of a `__wkf_workflow_<name>` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowMessage {
    #[serde(rename = "runId")]
    pub run_id: RunId,

    #[serde(
        rename = "requestedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub requested_at: Option<DateTime<Utc>>,

    /// Opaque trace carrier propagated by the host.
    #[serde(rename = "traceCarrier", default, skip_serializing_if = "Option::is_none")]
    pub trace_carrier: Option<serde_json::Value>,
}

impl WorkflowMessage {
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            requested_at: Some(Utc::now()),
            trace_carrier: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Payload of a `__wkf_step_<stepId>` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct StepMessage {
    #[serde(rename = "runId")]
    #[schema(value_type = String)]
    pub run_id: RunId,

    #[serde(rename = "correlationId")]
    #[schema(value_type = String)]
    pub correlation_id: CorrelationId,

    #[serde(rename = "stepName")]
    #[schema(value_type = String)]
    pub step_name: StepName,

    /// Serialized invocation, same bytes as the `step_created` payload.
    #[serde(with = "windlass_core::serde_bytes")]
    #[schema(value_type = String)]
    pub invocation: Vec<u8>,
}

impl StepMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Recognizes a health probe before payload parsing; returns the correlated
/// stream name when the message is one.
#[must_use]
pub fn health_probe(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value
        .get(HEALTH_FIELD)?
        .get("correlationId")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn workflow_message_roundtrip() {
        let message = WorkflowMessage::new(RunId::new());
        let bytes = message.to_bytes().expect("serialize");
        let parsed = WorkflowMessage::from_bytes(&bytes).expect("deserialize");
        assert_eq!(parsed, message);
    }

    #[test]
    fn workflow_message_wire_field_names() {
        let message = WorkflowMessage::new(RunId::new());
        let json: serde_json::Value =
            serde_json::from_slice(&message.to_bytes().expect("serialize")).expect("json");
        assert!(json.get("runId").is_some());
        assert!(json.get("requestedAt").is_some());
    }

    #[test]
    fn step_message_roundtrip() {
        let message = StepMessage {
            run_id: RunId::new(),
            correlation_id: CorrelationId::step(Ulid::new()),
            step_name: StepName::new("./math.ts", "add"),
            invocation: b"devl{}".to_vec(),
        };
        let bytes = message.to_bytes().expect("serialize");
        let parsed = StepMessage::from_bytes(&bytes).expect("deserialize");
        assert_eq!(parsed, message);
    }

    #[test]
    fn health_probe_recognized() {
        let payload = br#"{"__health":{"correlationId":"strm_01HZXW0000000000000000000"}}"#;
        assert_eq!(
            health_probe(payload).as_deref(),
            Some("strm_01HZXW0000000000000000000")
        );

        assert!(health_probe(br#"{"runId":"wrun_x"}"#).is_none());
        assert!(health_probe(b"not json").is_none());
    }
}
