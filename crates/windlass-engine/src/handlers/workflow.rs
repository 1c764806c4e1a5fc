//! The workflow handler: one queue delivery = one replay pass.

use tracing::{debug, error, info, instrument, warn};

use windlass_core::{Event, EventType, NewEvent, Run, RunStatus, WorkflowError, WorkflowName};
use windlass_world::{Delivery, HandlerOutcome, QueueError, WorldError};

use crate::engine::{replay, ReplayOutcome, ReplayReport};
use crate::health;
use crate::messages::{health_probe, WorkflowMessage};
use crate::payloads;
use crate::runtime::{transient, Runtime};

impl Runtime {
    /// Handles one `__wkf_workflow_<name>` delivery.
    #[instrument(skip(self, delivery), fields(topic = %delivery.topic, attempt = delivery.attempt))]
    pub(crate) async fn handle_workflow_delivery(
        &self,
        delivery: Delivery,
    ) -> Result<HandlerOutcome, QueueError> {
        // Health probes are recognized before payload parsing.
        if let Some(correlation) = health_probe(&delivery.payload) {
            health::respond(self.world(), "workflow", &correlation).await;
            return Ok(None);
        }

        let message = WorkflowMessage::from_bytes(&delivery.payload)
            .map_err(|e| QueueError::Handler(format!("bad workflow message: {e}")))?;
        let workflow_name = WorkflowName::from_topic(&delivery.topic)
            .map_err(|e| QueueError::Handler(format!("bad workflow topic: {e}")))?;
        let run_id = message.run_id;

        let run = match self.world().get_run(run_id).await {
            Ok(run) => run,
            Err(WorldError::RunNotFound(_)) => {
                error!(%run_id, "workflow message for unknown run, dropping");
                return Ok(None);
            }
            Err(e) => return Err(transient(e)),
        };

        // Terminal runs (including cancelled) perform no appends at all.
        if run.status.is_terminal() {
            debug!(%run_id, status = %run.status, "run already terminal");
            return Ok(None);
        }

        let run = if run.status == RunStatus::Pending {
            match self
                .world()
                .append_event(run_id, NewEvent::new(EventType::RunStarted))
                .await
            {
                Ok((_, snapshot)) => snapshot,
                Err(WorldError::RunTerminal { .. }) => return Ok(None),
                Err(e) => return Err(transient(e)),
            }
        } else {
            run
        };

        let mut events = match self.world().load_events(run_id).await {
            Ok(events) => events,
            Err(e) => return Err(transient(e)),
        };
        if events.len() > self.config().max_events_per_run {
            let error = WorkflowError::new(format!(
                "run has too many events ({} > {})",
                events.len(),
                self.config().max_events_per_run
            ));
            return self.fail_run(&run, error).await;
        }

        self.synthesize_due_waits(&run, &mut events).await?;

        let correlation_events: Vec<Event> = events
            .into_iter()
            .filter(|e| e.correlation_id.is_some())
            .collect();

        let Some(workflow_fn) = self.registry().get_workflow(&workflow_name) else {
            return self
                .fail_run(
                    &run,
                    WorkflowError::new(format!("unknown workflow {workflow_name}")),
                )
                .await;
        };

        let report = match replay(workflow_fn, &run, correlation_events.clone()) {
            Ok(report) => report,
            Err(engine_error) => {
                error!(%run_id, %engine_error, "replay failed");
                return self
                    .fail_run(&run, WorkflowError::new(engine_error.to_string()))
                    .await;
            }
        };

        self.apply_report(&run, &correlation_events, report).await
    }

    /// Applies the durable side effects of a finished replay pass.
    async fn apply_report(
        &self,
        run: &Run,
        events: &[Event],
        report: ReplayReport,
    ) -> Result<HandlerOutcome, QueueError> {
        self.append_disposals(run, events, &report.disposals).await?;

        match report.outcome {
            ReplayOutcome::Completed(value) => {
                let output = match payloads::encode_run_output(&value) {
                    Ok(output) => output,
                    Err(codec_error) => {
                        // The failing value is logged, never encoded.
                        error!(run_id = %run.run_id, value = ?value, "unserializable workflow return value");
                        return self
                            .fail_run(run, WorkflowError::new(codec_error.to_string()))
                            .await;
                    }
                };
                match self
                    .world()
                    .append_event(
                        run.run_id,
                        NewEvent::new(EventType::RunCompleted).with_data(output),
                    )
                    .await
                {
                    Ok(_) => info!(run_id = %run.run_id, "run completed"),
                    Err(WorldError::RunTerminal { .. }) => {
                        debug!(run_id = %run.run_id, "run became terminal during replay")
                    }
                    Err(e) => return Err(transient(e)),
                }
                Ok(None)
            }
            ReplayOutcome::Failed(error) => self.fail_run(run, error).await,
            ReplayOutcome::Suspended => {
                debug!(
                    run_id = %run.run_id,
                    steps = report.counts.steps,
                    hooks = report.counts.hooks,
                    waits = report.counts.waits,
                    runs = report.counts.runs,
                    "run suspended"
                );
                self.handle_suspension(run, events, &report.pending).await
            }
        }
    }

    /// Appends `run_failed` with a source-remapped stack.
    pub(crate) async fn fail_run(
        &self,
        run: &Run,
        mut error: WorkflowError,
    ) -> Result<HandlerOutcome, QueueError> {
        if let Some(stack) = &error.stack {
            error.stack = Some(self.remapper().remap(stack));
        }
        warn!(run_id = %run.run_id, message = %error.message, "run failed");

        let data = payloads::encode_run_failure(&error)
            .map_err(|e| QueueError::Handler(format!("failed to encode run failure: {e}")))?;
        match self
            .world()
            .append_event(run.run_id, NewEvent::new(EventType::RunFailed).with_data(data))
            .await
        {
            Ok(_) | Err(WorldError::RunTerminal { .. }) => Ok(None),
            Err(e) => Err(transient(e)),
        }
    }

    /// Synthesizes `wait_completed` for every due `wait_created` without one,
    /// appending durably and extending the in-memory list.
    async fn synthesize_due_waits(
        &self,
        run: &Run,
        events: &mut Vec<Event>,
    ) -> Result<(), QueueError> {
        let now = self.wall_clock().now();
        let mut due = Vec::new();

        for event in events.iter() {
            if event.event_type != EventType::WaitCreated {
                continue;
            }
            let Some(correlation_id) = event.correlation_id else {
                continue;
            };
            let completed = events.iter().any(|e| {
                e.event_type == EventType::WaitCompleted
                    && e.correlation_id == Some(correlation_id)
            });
            if completed {
                continue;
            }
            let Some(bytes) = event.event_data.as_deref() else {
                continue;
            };
            match payloads::decode_wait_created(bytes, run.spec_version) {
                Ok(resume_at) if resume_at <= now => due.push(correlation_id),
                Ok(_) => {}
                Err(e) => warn!(%correlation_id, %e, "unreadable wait_created payload"),
            }
        }

        for correlation_id in due {
            match self
                .world()
                .append_event(
                    run.run_id,
                    NewEvent::new(EventType::WaitCompleted).with_correlation(correlation_id),
                )
                .await
            {
                Ok((event, _)) => {
                    debug!(%correlation_id, "synthesized wait_completed");
                    events.push(event);
                }
                Err(WorldError::RunTerminal { .. }) => break,
                Err(e) => return Err(transient(e)),
            }
        }
        Ok(())
    }

    /// Appends `hook_disposed` for user-requested disposals, once each.
    async fn append_disposals(
        &self,
        run: &Run,
        events: &[Event],
        disposals: &[windlass_core::CorrelationId],
    ) -> Result<(), QueueError> {
        for correlation_id in disposals {
            let already = events.iter().any(|e| {
                e.event_type == EventType::HookDisposed
                    && e.correlation_id == Some(*correlation_id)
            });
            if already {
                continue;
            }

            match self
                .world()
                .append_event(
                    run.run_id,
                    NewEvent::new(EventType::HookDisposed).with_correlation(*correlation_id),
                )
                .await
            {
                Ok(_) => debug!(%correlation_id, "hook disposed"),
                Err(WorldError::RunTerminal { .. } | WorldError::IllegalTransition { .. }) => {
                    continue
                }
                Err(e) => return Err(transient(e)),
            }

            // Webhook deliveries for this token now fail fast.
            let token = events
                .iter()
                .find(|e| {
                    e.event_type == EventType::HookCreated
                        && e.correlation_id == Some(*correlation_id)
                })
                .and_then(|e| e.event_data.as_deref())
                .and_then(|bytes| payloads::decode_hook_created(bytes, run.spec_version).ok())
                .map(|info| info.token);
            if let Some(token) = token {
                if let Err(e) = self.world().remove_hook(&token).await {
                    warn!(%e, "failed to drop hook token");
                }
            }
        }
        Ok(())
    }
}
