//! Client entry points: launch runs and observe them.
//!
//! The client talks to the same world the handlers use; there is no separate
//! wire protocol for embedded deployments. Values cross the client boundary,
//! so step references are refused and live streams travel as named handles
//! backed by the stream store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tracing::debug;

use windlass_codec::{hydrate_versioned, Boundary, CodecError, Value};
use windlass_core::{RunId, RunStatus, StreamId, WorkflowError, WorkflowName};
use windlass_engine::{Runtime, RuntimeError};
use windlass_world::WorldError;

use crate::streams::{ByteStreamReader, ValueStreamReader, ValueStreamWriter};

/// Poll interval while awaiting a terminal status.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Errors surfaced by the client API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The run failed; the error carries the remapped stack.
    #[error("run failed: {0}")]
    RunFailed(WorkflowError),

    /// The run was cancelled before producing output.
    #[error("run was cancelled")]
    RunCancelled,

    /// `return_value` timed out waiting for a terminal status.
    #[error("timed out after {0:?} waiting for the run to finish")]
    Timeout(Duration),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    World(#[from] WorldError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Handle for launching and observing runs.
#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
}

impl Client {
    /// Creates a client over an attached runtime.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Launches a run of a registered workflow and returns its handle.
    pub async fn start(
        &self,
        workflow: &WorkflowName,
        input: Value,
    ) -> Result<RunHandle, ClientError> {
        let run = self.runtime.start_run(workflow, input).await?;
        debug!(run_id = %run.run_id, workflow = %workflow, "run started via client");
        Ok(RunHandle {
            runtime: Arc::clone(&self.runtime),
            run_id: run.run_id,
        })
    }

    /// Handle to an existing run.
    #[must_use]
    pub fn run(&self, run_id: RunId) -> RunHandle {
        RunHandle {
            runtime: Arc::clone(&self.runtime),
            run_id,
        }
    }

    /// Allocates a named byte stream a caller can feed while (or before) the
    /// workflow reads it. Include the returned handle value in the workflow
    /// arguments; write through the writer, then close it.
    #[must_use]
    pub fn byte_stream(&self, run_id: RunId) -> (Value, windlass_engine::StreamWriter) {
        let name = StreamId::new();
        let writer = windlass_engine::StreamWriter::new(
            Arc::clone(self.runtime.world()),
            name,
            run_id,
        );
        (
            Value::Stream(windlass_codec::StreamHandle::bytes(name)),
            writer,
        )
    }

    /// Like [`byte_stream`](Self::byte_stream) for rich values; each value is
    /// framed and serialized through the client boundary.
    #[must_use]
    pub fn value_stream(&self, run_id: RunId) -> (Value, ValueStreamWriter) {
        let name = StreamId::new();
        let writer = ValueStreamWriter::new(
            windlass_engine::StreamWriter::new(Arc::clone(self.runtime.world()), name, run_id),
            Boundary::Client,
        );
        (
            Value::Stream(windlass_codec::StreamHandle::values(name)),
            writer,
        )
    }

    /// Pre-allocates a run id so input streams can be scoped to the run they
    /// will feed.
    #[must_use]
    pub fn new_run_id(&self) -> RunId {
        RunId::new()
    }

    /// Delivers a hook payload by token, as the webhook endpoint does.
    pub async fn deliver_hook(
        &self,
        token: &str,
        payload: Value,
    ) -> Result<Option<Value>, ClientError> {
        Ok(self.runtime.deliver_hook(token, payload).await?)
    }
}

/// Handle to one run.
#[derive(Clone)]
pub struct RunHandle {
    runtime: Arc<Runtime>,
    run_id: RunId,
}

impl RunHandle {
    /// The run's id.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Current run record snapshot.
    pub async fn get(&self) -> Result<windlass_core::Run, ClientError> {
        Ok(self.runtime.world().get_run(self.run_id).await?)
    }

    /// Current status.
    pub async fn status(&self) -> Result<RunStatus, ClientError> {
        Ok(self.get().await?.status)
    }

    /// `created_at` / `started_at` / `completed_at` timestamps. Which are
    /// set depends on status: pending has neither optional one, running has
    /// `started_at`, terminal has both.
    pub async fn timestamps(
        &self,
    ) -> Result<(DateTime<Utc>, Option<DateTime<Utc>>, Option<DateTime<Utc>>), ClientError> {
        let run = self.get().await?;
        Ok((run.created_at, run.started_at, run.completed_at))
    }

    /// Awaits the run's output, polling until a terminal status or the
    /// timeout. The output crosses the client boundary.
    pub async fn return_value(&self, timeout: Duration) -> Result<Value, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let run = self.get().await?;
            match run.status {
                RunStatus::Completed => {
                    let output = run.output.unwrap_or_default();
                    return Ok(hydrate_versioned(
                        &output,
                        run.spec_version,
                        Boundary::Client,
                        "run output",
                    )?);
                }
                RunStatus::Failed => {
                    let error = run
                        .error
                        .unwrap_or_else(|| WorkflowError::new("workflow failed"));
                    return Err(ClientError::RunFailed(error));
                }
                RunStatus::Cancelled => return Err(ClientError::RunCancelled),
                RunStatus::Pending | RunStatus::Running => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ClientError::Timeout(timeout));
                    }
                    tokio::time::sleep(STATUS_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Cancels the run. Terminal runs are left untouched.
    pub async fn cancel(&self) -> Result<RunStatus, ClientError> {
        let run = self.runtime.cancel_run(self.run_id).await?;
        Ok(run.status)
    }

    /// Tail-reads a byte stream scoped to this run.
    #[must_use]
    pub fn read_byte_stream(&self, name: StreamId) -> ByteStreamReader {
        ByteStreamReader::new(self.raw_stream(name))
    }

    /// Tail-reads a value stream scoped to this run, decoding frames through
    /// the client boundary.
    #[must_use]
    pub fn read_value_stream(&self, name: StreamId) -> ValueStreamReader {
        ValueStreamReader::new(self.raw_stream(name), Boundary::Client)
    }

    fn raw_stream(&self, name: StreamId) -> BoxStream<'static, Result<bytes::Bytes, WorldError>> {
        self.runtime.world().read_from_stream(name, 0)
    }
}
