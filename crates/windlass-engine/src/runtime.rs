//! Runtime wiring: world + queue + registries + remapper.
//!
//! One `Runtime` per process. It registers the workflow and step queue
//! handlers, owns `start()`/cancel/hook-delivery entry points, and hosts the
//! built-in spawn step that carries child workflows.

use std::sync::Arc;

use futures::FutureExt;
use tracing::info;

use windlass_codec::{dehydrate, Boundary, CodecError, Value};
use windlass_core::{
    EventType, Manifest, NewEvent, Run, RunId, StepName, WorkflowName, STEP_TOPIC_PREFIX,
    WORKFLOW_TOPIC_PREFIX,
};
use windlass_world::{Queue, QueueError, World, WorldError};

use crate::clock::WallClock;
use crate::messages::WorkflowMessage;
use crate::registry::Registry;
use crate::remap::StackRemapper;

/// Runtime limits.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Safety ceiling on a run's event count.
    pub max_events_per_run: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_events_per_run: 10_000,
        }
    }
}

/// Errors from runtime entry points (`start`, cancel, hook delivery).
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("unknown workflow {0}")]
    UnknownWorkflow(WorkflowName),

    #[error("hook is no longer receiving payloads")]
    HookClosed,

    #[error(transparent)]
    World(#[from] WorldError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("message payload is not valid: {0}")]
    Message(#[from] serde_json::Error),
}

/// The event-sourced runtime around the replay engine.
pub struct Runtime {
    world: Arc<dyn World>,
    queue: Arc<dyn Queue>,
    registry: Registry,
    remapper: StackRemapper,
    clock: WallClock,
    config: RuntimeConfig,
}

/// The built-in step that spawns child workflows. Registered implicitly; the
/// step handler resolves it before consulting the registry.
#[must_use]
pub fn spawn_step_name() -> StepName {
    StepName::new(
        concat!("windlass@", env!("CARGO_PKG_VERSION")),
        "spawnWorkflow",
    )
}

impl Runtime {
    /// Creates a runtime over the given world and queue.
    pub fn new(world: Arc<dyn World>, queue: Arc<dyn Queue>) -> Self {
        Self::with_config(world, queue, RuntimeConfig::default())
    }

    /// Creates a runtime with explicit limits.
    pub fn with_config(
        world: Arc<dyn World>,
        queue: Arc<dyn Queue>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            world,
            queue,
            registry: Registry::new(),
            remapper: StackRemapper::new(),
            clock: WallClock::new(),
            config,
        }
    }

    /// The workflow/step registry, for startup-time registration.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// The stack remapper, for startup-time bundle registration.
    pub fn remapper_mut(&mut self) -> &mut StackRemapper {
        &mut self.remapper
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn remapper(&self) -> &StackRemapper {
        &self.remapper
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn wall_clock(&self) -> &WallClock {
        &self.clock
    }

    /// The world backend.
    #[must_use]
    pub fn world(&self) -> &Arc<dyn World> {
        &self.world
    }

    /// The queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    /// Static manifest of everything registered.
    #[must_use]
    pub fn manifest(&self) -> Manifest {
        self.registry.manifest()
    }

    /// Registers the workflow and step topic handlers on the queue. Call
    /// once, after all registrations.
    pub async fn attach(runtime: &Arc<Runtime>) -> Result<(), QueueError> {
        let handler_runtime = Arc::clone(runtime);
        runtime
            .queue
            .create_handler(
                WORKFLOW_TOPIC_PREFIX,
                Arc::new(move |delivery| {
                    let runtime = Arc::clone(&handler_runtime);
                    async move { runtime.handle_workflow_delivery(delivery).await }.boxed()
                }),
            )
            .await?;

        let handler_runtime = Arc::clone(runtime);
        runtime
            .queue
            .create_handler(
                STEP_TOPIC_PREFIX,
                Arc::new(move |delivery| {
                    let runtime = Arc::clone(&handler_runtime);
                    async move { runtime.handle_step_delivery(delivery).await }.boxed()
                }),
            )
            .await?;

        info!(
            workflows = runtime.registry.workflow_names().len(),
            "runtime attached to queue"
        );
        Ok(())
    }

    /// Launches a new run of a registered workflow. Returns the pending run
    /// record; execution proceeds through the queue.
    pub async fn start_run(
        &self,
        workflow: &WorkflowName,
        input: Value,
    ) -> Result<Run, RuntimeError> {
        let input = dehydrate(&input, Boundary::Client, "workflow arguments")?;
        self.start_run_serialized(workflow, input, RunId::new())
            .await
    }

    /// Launches a run with pre-serialized input and a caller-chosen id; the
    /// spawn step uses the deterministic id for exactly-once child creation.
    pub(crate) async fn start_run_serialized(
        &self,
        workflow: &WorkflowName,
        input: Vec<u8>,
        run_id: RunId,
    ) -> Result<Run, RuntimeError> {
        if self.registry.get_workflow(workflow).is_none() {
            return Err(RuntimeError::UnknownWorkflow(workflow.clone()));
        }

        let run = Run::new(run_id, workflow.clone(), input);
        match self.world.create_run(run.clone()).await {
            Ok(()) => {
                self.world
                    .append_event(run_id, NewEvent::new(EventType::RunCreated))
                    .await?;
                info!(%run_id, workflow = %workflow, "run created");
            }
            // At-least-once redelivery of a spawn lands here; the run is
            // already on its way.
            Err(WorldError::RunExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.enqueue_workflow_message(workflow, run_id).await?;
        self.world.get_run(run_id).await.map_err(Into::into)
    }

    /// Appends `run_cancelled` unless the run is already terminal. Returns
    /// the resulting snapshot.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<Run, RuntimeError> {
        let run = self.world.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        match self
            .world
            .append_event(run_id, NewEvent::new(EventType::RunCancelled))
            .await
        {
            Ok((_, snapshot)) => Ok(snapshot),
            // Lost the race against another terminal event.
            Err(WorldError::RunTerminal { .. }) => Ok(self.world.get_run(run_id).await?),
            Err(e) => Err(e.into()),
        }
    }

    /// Delivers a hook payload by token (webhook endpoint). Returns the
    /// hook's static response if one was registered.
    pub async fn deliver_hook(
        &self,
        token: &str,
        payload: Value,
    ) -> Result<Option<Value>, RuntimeError> {
        let registration = self.world.resolve_hook(token).await?;
        let run = self.world.get_run(registration.run_id).await?;
        if run.status.is_terminal() {
            return Err(RuntimeError::HookClosed);
        }

        let data = crate::payloads::encode_hook_payload(&payload)?;
        match self
            .world
            .append_event(
                registration.run_id,
                NewEvent::new(EventType::HookReceived)
                    .with_correlation(registration.correlation_id)
                    .with_data(data),
            )
            .await
        {
            Ok(_) => {}
            Err(WorldError::RunTerminal { .. } | WorldError::IllegalTransition { .. }) => {
                return Err(RuntimeError::HookClosed)
            }
            Err(e) => return Err(e.into()),
        }

        self.enqueue_workflow_message(&run.workflow_name, registration.run_id)
            .await?;

        // Surface the static response recorded on hook_created, if any.
        let events = self.world.load_events(registration.run_id).await?;
        let static_response = events
            .iter()
            .find(|e| {
                e.event_type == EventType::HookCreated
                    && e.correlation_id == Some(registration.correlation_id)
            })
            .and_then(|e| e.event_data.as_deref())
            .and_then(|bytes| {
                crate::payloads::decode_hook_created(bytes, run.spec_version).ok()
            })
            .and_then(|info| info.static_response);
        Ok(static_response)
    }

    /// Wakes a run's workflow handler; idempotent by run id.
    pub(crate) async fn enqueue_workflow_message(
        &self,
        workflow: &WorkflowName,
        run_id: RunId,
    ) -> Result<(), RuntimeError> {
        let payload = WorkflowMessage::new(run_id).to_bytes()?;
        self.queue
            .enqueue(&workflow.topic(), &run_id.to_string(), payload)
            .await?;
        Ok(())
    }
}

/// Maps a backend failure to a transport error so the queue redelivers.
pub(crate) fn transient(err: WorldError) -> QueueError {
    QueueError::Handler(err.to_string())
}
