//! Queue-delivered health checks.
//!
//! A probe message `{"__health": {"correlationId": <stream name>}}` travels
//! the same queue as real work, so a passing check proves the whole delivery
//! path, not just an HTTP listener. The handler answers with one JSON status
//! line on the correlated stream and closes it; the initiator reads the
//! stream it opened in parallel with the enqueue.

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;
use ulid::Ulid;

use windlass_core::{RunId, StreamId};
use windlass_world::{World, WorldError};

/// Payload field that marks a health probe.
pub const HEALTH_FIELD: &str = "__health";

/// Health streams are not owned by any run.
fn health_run_id() -> RunId {
    RunId::from_ulid(Ulid::nil())
}

/// Status line written for a passing probe.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub endpoint: String,
    #[serde(rename = "runtimeVersion")]
    pub runtime_version: String,
}

impl HealthStatus {
    #[must_use]
    pub fn ok(endpoint: &str) -> Self {
        Self {
            status: "ok".to_string(),
            endpoint: endpoint.to_string(),
            runtime_version: concat!("windlass/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Answers a probe on its correlated stream. Failures are logged, never
/// propagated: a health check must not poison the delivery path it probes.
pub async fn respond(world: &Arc<dyn World>, endpoint: &str, correlation: &str) {
    let Ok(stream) = correlation.parse::<StreamId>() else {
        warn!(correlation, "health probe with unparseable stream name");
        return;
    };

    if let Err(err) = write_status(world, endpoint, stream).await {
        warn!(%err, correlation, "failed to answer health probe");
    }
}

async fn write_status(
    world: &Arc<dyn World>,
    endpoint: &str,
    stream: StreamId,
) -> Result<(), WorldError> {
    let status = HealthStatus::ok(endpoint);
    let mut line = serde_json::to_vec(&status)
        .map_err(|e| WorldError::Serialization(e.to_string()))?;
    line.push(b'\n');

    world
        .write_to_stream(stream, health_run_id(), Bytes::from(line))
        .await?;
    world.close_stream(stream, health_run_id()).await
}
