//! The suspension handler: pending work becomes durable work.
//!
//! Runs after a replay pass that ended in suspension. Every pending item
//! without a `*_created` event gets one (at most once per correlation id,
//! however often the workflow message is redelivered), steps and spawns are
//! enqueued, and the earliest outstanding wait determines when the queue
//! should redeliver the workflow message.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, instrument};

use windlass_core::{CorrelationId, Event, EventType, NewEvent, Run};
use windlass_world::{HandlerOutcome, HookRegistration, QueueError, WorldError};

use crate::messages::StepMessage;
use crate::payloads;
use crate::pending::{PendingQueue, PendingWork};
use crate::runtime::{spawn_step_name, transient, Runtime};

impl Runtime {
    /// Converts the pending queue into `*_created` events and queue
    /// messages; returns the redelivery delay for the earliest wait.
    #[instrument(skip_all, fields(run_id = %run.run_id, pending = pending.len()))]
    pub(crate) async fn handle_suspension(
        &self,
        run: &Run,
        events: &[Event],
        pending: &PendingQueue,
    ) -> Result<HandlerOutcome, QueueError> {
        let created: HashSet<CorrelationId> = events
            .iter()
            .filter(|e| e.event_type.is_correlation_created())
            .filter_map(|e| e.correlation_id)
            .collect();
        let started: HashSet<CorrelationId> = events
            .iter()
            .filter(|e| e.event_type == EventType::StepStarted)
            .filter_map(|e| e.correlation_id)
            .collect();

        for (correlation_id, work) in pending.iter() {
            let has_created = work.has_created_event() || created.contains(correlation_id);

            match work {
                PendingWork::Step(step) => {
                    let invocation = payloads::encode_step_created(
                        &step.name,
                        &step.args,
                        step.this_val.as_ref(),
                        step.closure_vars.as_ref(),
                    )
                    .map_err(|e| {
                        QueueError::Handler(format!("failed to encode step invocation: {e}"))
                    })?;

                    if !has_created {
                        self.append_created(
                            run,
                            *correlation_id,
                            EventType::StepCreated,
                            Some(invocation.clone()),
                        )
                        .await?;
                    }
                    // Created but never started: the message was lost or the
                    // process died before the step ran. Enqueue is idempotent.
                    if !started.contains(correlation_id) {
                        let message = StepMessage {
                            run_id: run.run_id,
                            correlation_id: *correlation_id,
                            step_name: step.name.clone(),
                            invocation,
                        };
                        self.enqueue_step_message(&message).await?;
                    }
                }
                PendingWork::Run(spawn) => {
                    let args = payloads::encode_spawn_args(&spawn.workflow_name, &spawn.input)
                        .map_err(|e| {
                            QueueError::Handler(format!("failed to encode spawn: {e}"))
                        })?;
                    let invocation =
                        payloads::encode_step_created(&spawn_step_name(), &args, None, None)
                            .map_err(|e| {
                                QueueError::Handler(format!("failed to encode spawn: {e}"))
                            })?;

                    if !has_created {
                        self.append_created(
                            run,
                            *correlation_id,
                            EventType::StepCreated,
                            Some(invocation.clone()),
                        )
                        .await?;
                    }
                    if !started.contains(correlation_id) {
                        let message = StepMessage {
                            run_id: run.run_id,
                            correlation_id: *correlation_id,
                            step_name: spawn_step_name(),
                            invocation,
                        };
                        self.enqueue_step_message(&message).await?;
                    }
                }
                PendingWork::Wait(wait) => {
                    if !has_created {
                        let data = payloads::encode_wait_created(wait.resume_at).map_err(|e| {
                            QueueError::Handler(format!("failed to encode wait: {e}"))
                        })?;
                        self.append_created(
                            run,
                            *correlation_id,
                            EventType::WaitCreated,
                            Some(data),
                        )
                        .await?;
                    }
                }
                PendingWork::Hook(hook) => {
                    if !has_created {
                        let data = payloads::encode_hook_created(
                            &hook.token,
                            hook.metadata.as_ref(),
                            hook.static_response.as_ref(),
                        )
                        .map_err(|e| {
                            QueueError::Handler(format!("failed to encode hook: {e}"))
                        })?;
                        self.append_created(
                            run,
                            *correlation_id,
                            EventType::HookCreated,
                            Some(data),
                        )
                        .await?;
                    }
                    // Keep the token index current whether or not the created
                    // event already existed; the index is a cache over the log.
                    self.world()
                        .register_hook(
                            &hook.token,
                            HookRegistration {
                                run_id: run.run_id,
                                correlation_id: *correlation_id,
                            },
                        )
                        .await
                        .map_err(transient)?;
                }
            }
        }

        // The queue is the only source of wall-clock scheduling: ask for
        // redelivery at the earliest outstanding wake time.
        let now = self.wall_clock().now();
        let outcome = pending.earliest_resume_at().map(|resume_at| {
            let millis = (resume_at - now).num_milliseconds().max(0) as u64;
            let seconds = millis.div_ceil(1000).max(1);
            Duration::from_secs(seconds)
        });
        if let Some(delay) = &outcome {
            debug!(?delay, "suspension requests timed redelivery");
        }
        Ok(outcome)
    }

    async fn append_created(
        &self,
        run: &Run,
        correlation_id: CorrelationId,
        event_type: EventType,
        data: Option<Vec<u8>>,
    ) -> Result<(), QueueError> {
        let mut event = NewEvent::new(event_type).with_correlation(correlation_id);
        if let Some(data) = data {
            event = event.with_data(data);
        }
        match self.world().append_event(run.run_id, event).await {
            Ok(_) => {
                debug!(%correlation_id, %event_type, "created event appended");
                Ok(())
            }
            // Another delivery won the race; the log already has it.
            Err(WorldError::IllegalTransition { .. } | WorldError::RunTerminal { .. }) => Ok(()),
            Err(e) => Err(transient(e)),
        }
    }

    async fn enqueue_step_message(&self, message: &StepMessage) -> Result<(), QueueError> {
        let payload = message
            .to_bytes()
            .map_err(|e| QueueError::Handler(format!("failed to encode step message: {e}")))?;
        self.queue()
            .enqueue(
                &message.step_name.topic(),
                &message.correlation_id.to_string(),
                payload,
            )
            .await?;
        debug!(
            correlation_id = %message.correlation_id,
            step = %message.step_name,
            "step enqueued"
        );
        Ok(())
    }
}
