//! In-memory implementation of the world.
//!
//! The reference backend: used by tests and by single-process local
//! deployments. It also enforces the strictest version of the log contract
//! (terminal-event fence and per-correlation state machines), so anything
//! that replays here replays anywhere.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use tokio::sync::Notify;

use windlass_core::{Event, EventId, EventType, NewEvent, Run, RunId, RunStatus, StreamId};

use crate::store::{decode_run_error, HookRegistration, RunPatch, World, WorldError};

struct RunState {
    run: Run,
    events: Vec<Event>,
}

struct StreamState {
    run_id: Option<RunId>,
    chunks: Vec<Bytes>,
    closed: bool,
    notify: Arc<Notify>,
}

impl StreamState {
    fn empty() -> Self {
        Self {
            run_id: None,
            chunks: Vec::new(),
            closed: false,
            notify: Arc::new(Notify::new()),
        }
    }
}

struct Inner {
    runs: RwLock<HashMap<RunId, RunState>>,
    streams: RwLock<HashMap<StreamId, StreamState>>,
    hooks: RwLock<HashMap<String, HookRegistration>>,
}

/// In-memory world.
///
/// # Example
///
/// ```
/// use windlass_world::InMemoryWorld;
///
/// let world = InMemoryWorld::new();
/// ```
#[derive(Clone)]
pub struct InMemoryWorld {
    inner: Arc<Inner>,
}

impl Default for InMemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorld {
    /// Create an empty world.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                runs: RwLock::new(HashMap::new()),
                streams: RwLock::new(HashMap::new()),
                hooks: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Number of runs (for tests).
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.inner.runs.read().len()
    }

    /// Number of chunks currently stored for a stream (for tests).
    #[must_use]
    pub fn stream_len(&self, name: StreamId) -> usize {
        self.inner
            .streams
            .read()
            .get(&name)
            .map_or(0, |s| s.chunks.len())
    }
}

#[async_trait]
impl World for InMemoryWorld {
    async fn create_run(&self, run: Run) -> Result<(), WorldError> {
        let mut runs = self.inner.runs.write();
        if runs.contains_key(&run.run_id) {
            return Err(WorldError::RunExists(run.run_id));
        }
        runs.insert(
            run.run_id,
            RunState {
                run,
                events: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Run, WorldError> {
        self.inner
            .runs
            .read()
            .get(&run_id)
            .map(|state| state.run.clone())
            .ok_or(WorldError::RunNotFound(run_id))
    }

    async fn update_run(&self, run_id: RunId, patch: RunPatch) -> Result<Run, WorldError> {
        let mut runs = self.inner.runs.write();
        let state = runs.get_mut(&run_id).ok_or(WorldError::RunNotFound(run_id))?;
        if let Some(expired_at) = patch.expired_at {
            state.run.expired_at = Some(expired_at);
        }
        if let Some(context) = patch.execution_context {
            state.run.execution_context = context;
        }
        Ok(state.run.clone())
    }

    async fn append_event(
        &self,
        run_id: RunId,
        new_event: NewEvent,
    ) -> Result<(Event, Run), WorldError> {
        let mut runs = self.inner.runs.write();
        let state = runs.get_mut(&run_id).ok_or(WorldError::RunNotFound(run_id))?;

        if state.run.status.is_terminal() {
            return Err(WorldError::RunTerminal {
                run_id,
                status: state.run.status,
            });
        }

        // Per-correlation state machine check.
        if let Some(correlation_id) = new_event.correlation_id {
            let previous = state
                .events
                .iter()
                .rev()
                .find(|e| e.correlation_id == Some(correlation_id))
                .map(|e| e.event_type);
            if !new_event.event_type.may_follow(previous) {
                return Err(WorldError::IllegalTransition {
                    correlation_id,
                    event_type: new_event.event_type,
                    previous,
                });
            }
        }

        let now = Utc::now();
        let event = Event {
            event_id: EventId::new(),
            run_id,
            event_type: new_event.event_type,
            correlation_id: new_event.correlation_id,
            created_at: now,
            spec_version: state.run.spec_version,
            event_data: new_event.event_data,
        };

        match event.event_type {
            EventType::RunStarted => {
                if state.run.status == RunStatus::Pending {
                    state.run.status = RunStatus::Running;
                    state.run.started_at = Some(now);
                }
            }
            EventType::RunCompleted => {
                state.run.status = RunStatus::Completed;
                state.run.completed_at = Some(now);
                state.run.output = event.event_data.clone();
            }
            EventType::RunFailed => {
                state.run.status = RunStatus::Failed;
                state.run.completed_at = Some(now);
                state.run.error = Some(decode_run_error(
                    event.event_data.as_deref(),
                    state.run.spec_version,
                ));
            }
            EventType::RunCancelled => {
                state.run.status = RunStatus::Cancelled;
                state.run.completed_at = Some(now);
            }
            _ => {}
        }

        state.events.push(event.clone());
        Ok((event, state.run.clone()))
    }

    async fn load_events(&self, run_id: RunId) -> Result<Vec<Event>, WorldError> {
        self.inner
            .runs
            .read()
            .get(&run_id)
            .map(|state| state.events.clone())
            .ok_or(WorldError::RunNotFound(run_id))
    }

    async fn write_to_stream(
        &self,
        name: StreamId,
        run_id: RunId,
        chunk: Bytes,
    ) -> Result<(), WorldError> {
        self.write_to_stream_multi(name, run_id, vec![chunk]).await
    }

    async fn write_to_stream_multi(
        &self,
        name: StreamId,
        run_id: RunId,
        chunks: Vec<Bytes>,
    ) -> Result<(), WorldError> {
        let mut streams = self.inner.streams.write();
        let state = streams.entry(name).or_insert_with(StreamState::empty);
        if state.closed {
            return Err(WorldError::StreamClosed(name));
        }
        state.run_id.get_or_insert(run_id);
        state.chunks.extend(chunks);
        state.notify.notify_waiters();
        Ok(())
    }

    async fn close_stream(&self, name: StreamId, run_id: RunId) -> Result<(), WorldError> {
        let mut streams = self.inner.streams.write();
        let state = streams.entry(name).or_insert_with(StreamState::empty);
        state.run_id.get_or_insert(run_id);
        state.closed = true;
        state.notify.notify_waiters();
        Ok(())
    }

    fn read_from_stream(
        &self,
        name: StreamId,
        start_index: usize,
    ) -> BoxStream<'static, Result<Bytes, WorldError>> {
        let inner = Arc::clone(&self.inner);

        Box::pin(futures::stream::unfold(start_index, move |index| {
            let inner = Arc::clone(&inner);
            async move {
                loop {
                    // Arm the notification before inspecting state so a write
                    // between the check and the await is not lost.
                    let notify = {
                        let mut streams = inner.streams.write();
                        let state = streams.entry(name).or_insert_with(StreamState::empty);
                        if let Some(chunk) = state.chunks.get(index) {
                            return Some((Ok(chunk.clone()), index + 1));
                        }
                        if state.closed {
                            return None;
                        }
                        Arc::clone(&state.notify)
                    };
                    notify.notified().await;
                }
            }
        }))
    }

    async fn register_hook(
        &self,
        token: &str,
        registration: HookRegistration,
    ) -> Result<(), WorldError> {
        self.inner
            .hooks
            .write()
            .insert(token.to_string(), registration);
        Ok(())
    }

    async fn resolve_hook(&self, token: &str) -> Result<HookRegistration, WorldError> {
        self.inner
            .hooks
            .read()
            .get(token)
            .cloned()
            .ok_or(WorldError::UnknownHookToken)
    }

    async fn remove_hook(&self, token: &str) -> Result<(), WorldError> {
        self.inner.hooks.write().remove(token);
        Ok(())
    }
}
