//! The `World` trait: event log, run store, stream store, hook index.
//!
//! The event log is the single source of shared state for a run; everything
//! else must be rebuildable from it. Appends are atomic with the run-record
//! mutation they imply, and return the post-append run snapshot so the
//! workflow handler can transition `pending -> running` without a second
//! read.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use windlass_core::{CorrelationId, Event, EventType, NewEvent, Run, RunId, RunStatus, StreamId};

/// Error type for world operations.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    /// Run not found.
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Run already exists (duplicate `create_run`).
    #[error("run already exists: {0}")]
    RunExists(RunId),

    /// A terminal run event has been appended; the log is fenced.
    #[error("run {run_id} is {status}; no further events are accepted")]
    RunTerminal { run_id: RunId, status: RunStatus },

    /// An event would violate its correlation's legal state machine.
    #[error(
        "illegal {event_type} for correlation {correlation_id} (previous: {previous:?})"
    )]
    IllegalTransition {
        correlation_id: CorrelationId,
        event_type: EventType,
        previous: Option<EventType>,
    },

    /// Writing to a stream that has been closed.
    #[error("stream {0} is closed")]
    StreamClosed(StreamId),

    /// Hook token has no registration.
    #[error("unknown hook token")]
    UnknownHookToken,

    /// Backend failure.
    #[error("database error: {0}")]
    Database(String),

    /// Record failed to encode or decode at rest.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for WorldError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Recovers the structured `{message, stack}` from a `run_failed` payload so
/// the run snapshot can carry it without re-reading the log.
pub(crate) fn decode_run_error(
    data: Option<&[u8]>,
    spec_version: u32,
) -> windlass_core::WorkflowError {
    use windlass_codec::{hydrate_versioned, Boundary, Value};
    use windlass_core::WorkflowError;

    let Some(bytes) = data else {
        return WorkflowError::new("workflow failed");
    };
    match hydrate_versioned(bytes, spec_version, Boundary::Workflow, "run failure") {
        Ok(Value::Object(entries)) => {
            let message = entries
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("workflow failed")
                .to_string();
            let mut error = WorkflowError::new(message);
            if let Some(stack) = entries.get("stack").and_then(Value::as_str) {
                error = error.with_stack(stack);
            }
            error
        }
        Ok(Value::Error(e)) => {
            let mut error = WorkflowError::new(e.message);
            if let Some(stack) = e.stack {
                error = error.with_stack(stack);
            }
            error
        }
        _ => WorkflowError::new(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Resolution of a hook token to its owning run and correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct HookRegistration {
    pub run_id: RunId,
    pub correlation_id: CorrelationId,
}

/// Fields a caller may patch on a run record outside the event path.
///
/// Status and timestamps are driven exclusively by event appends; the patch
/// covers host-owned metadata only.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub expired_at: Option<chrono::DateTime<chrono::Utc>>,
    pub execution_context: Option<serde_json::Value>,
}

/// Storage backend for runs, events, streams, and hook tokens.
///
/// Implementations must be thread-safe. Per-run ordering is required (events
/// for one run are observed in append order); cross-run ordering is not.
#[async_trait]
pub trait World: Send + Sync + 'static {
    // =========================================================================
    // Run store
    // =========================================================================

    /// Persist a new pending run.
    async fn create_run(&self, run: Run) -> Result<(), WorldError>;

    /// Fetch a run snapshot.
    async fn get_run(&self, run_id: RunId) -> Result<Run, WorldError>;

    /// Patch host-owned run metadata.
    async fn update_run(&self, run_id: RunId, patch: RunPatch) -> Result<Run, WorldError>;

    // =========================================================================
    // Event log
    // =========================================================================

    /// Append one event, atomically applying its run-level effect, and
    /// return the stored event together with the post-append run snapshot.
    ///
    /// Rejects appends once a terminal run event exists.
    async fn append_event(
        &self,
        run_id: RunId,
        event: NewEvent,
    ) -> Result<(Event, Run), WorldError>;

    /// All events for a run, in append order.
    async fn load_events(&self, run_id: RunId) -> Result<Vec<Event>, WorldError>;

    // =========================================================================
    // Stream store
    // =========================================================================

    /// Append one chunk to a stream, creating the stream on first write.
    async fn write_to_stream(
        &self,
        name: StreamId,
        run_id: RunId,
        chunk: Bytes,
    ) -> Result<(), WorldError>;

    /// Append a batch of chunks in order.
    async fn write_to_stream_multi(
        &self,
        name: StreamId,
        run_id: RunId,
        chunks: Vec<Bytes>,
    ) -> Result<(), WorldError>;

    /// Close a stream. Closed streams remain readable; further writes fail.
    async fn close_stream(&self, name: StreamId, run_id: RunId) -> Result<(), WorldError>;

    /// Read chunks from `start_index` (inclusive), cooperatively blocking
    /// for new chunks until the stream closes. Opening a stream that does
    /// not exist yet waits for its first write.
    fn read_from_stream(
        &self,
        name: StreamId,
        start_index: usize,
    ) -> BoxStream<'static, Result<Bytes, WorldError>>;

    // =========================================================================
    // Hook token index
    // =========================================================================

    /// Associate an externally-visible token with a hook correlation.
    async fn register_hook(
        &self,
        token: &str,
        registration: HookRegistration,
    ) -> Result<(), WorldError>;

    /// Resolve a token delivered on the webhook endpoint.
    async fn resolve_hook(&self, token: &str) -> Result<HookRegistration, WorldError>;

    /// Drop a token after its hook is disposed.
    async fn remove_hook(&self, token: &str) -> Result<(), WorldError>;
}
