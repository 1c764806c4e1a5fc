//! The step handler: hydrate, execute, decide retry, wake the workflow.

use tracing::{debug, error, info, instrument, warn};

use windlass_codec::{with_closure_vars, Value};
use windlass_core::{EventType, NewEvent, RetryPolicy, RunId, StepError};
use windlass_world::{Delivery, HandlerOutcome, QueueError, WorldError};

use crate::health;
use crate::messages::{health_probe, StepMessage};
use crate::payloads::{self, StepInvocation};
use crate::registry::StepContext;
use crate::runtime::{spawn_step_name, transient, Runtime};

impl Runtime {
    /// Handles one `__wkf_step_<stepId>` delivery.
    #[instrument(skip(self, delivery), fields(topic = %delivery.topic, attempt = delivery.attempt))]
    pub(crate) async fn handle_step_delivery(
        &self,
        delivery: Delivery,
    ) -> Result<HandlerOutcome, QueueError> {
        if let Some(correlation) = health_probe(&delivery.payload) {
            health::respond(self.world(), "step", &correlation).await;
            return Ok(None);
        }

        let message = StepMessage::from_bytes(&delivery.payload)
            .map_err(|e| QueueError::Handler(format!("bad step message: {e}")))?;
        let attempt = delivery.attempt;

        let run = match self.world().get_run(message.run_id).await {
            Ok(run) => run,
            Err(WorldError::RunNotFound(_)) => {
                error!(run_id = %message.run_id, "step message for unknown run, dropping");
                return Ok(None);
            }
            Err(e) => return Err(transient(e)),
        };
        if run.status.is_terminal() {
            debug!(run_id = %run.run_id, status = %run.status, "run terminal, skipping step");
            return Ok(None);
        }

        // step_started carries the attempt; a redelivery after the step
        // already finished trips the correlation state machine and is benign.
        let started_data = payloads::encode_attempt(attempt)
            .map_err(|e| QueueError::Handler(format!("failed to encode attempt: {e}")))?;
        match self
            .world()
            .append_event(
                run.run_id,
                NewEvent::new(EventType::StepStarted)
                    .with_correlation(message.correlation_id)
                    .with_data(started_data),
            )
            .await
        {
            Ok(_) => {}
            Err(WorldError::IllegalTransition { .. } | WorldError::RunTerminal { .. }) => {
                debug!(correlation_id = %message.correlation_id, "step already settled");
                return Ok(None);
            }
            Err(e) => return Err(transient(e)),
        }

        let invocation = match payloads::decode_step_invocation(&message.invocation, run.spec_version)
        {
            Ok(invocation) => invocation,
            Err(codec_error) => {
                // Unreadable arguments can never succeed, whatever the attempt.
                let error = StepError::fatal(codec_error.to_string());
                return self.settle_step_failure(&run, &message, error).await;
            }
        };

        let (result, policy) = self
            .execute_step(run.run_id, message.correlation_id, attempt, &invocation)
            .await;

        match result {
            Ok(value) => {
                let data = match payloads::encode_step_result(&value) {
                    Ok(data) => data,
                    Err(codec_error) => {
                        error!(run_id = %run.run_id, value = ?value, "unserializable step return value");
                        let error = StepError::fatal(codec_error.to_string());
                        return self.settle_step_failure(&run, &message, error).await;
                    }
                };
                match self
                    .world()
                    .append_event(
                        run.run_id,
                        NewEvent::new(EventType::StepCompleted)
                            .with_correlation(message.correlation_id)
                            .with_data(data),
                    )
                    .await
                {
                    Ok(_) => {
                        info!(step = %invocation.name, correlation_id = %message.correlation_id, "step completed")
                    }
                    Err(WorldError::IllegalTransition { .. } | WorldError::RunTerminal { .. }) => {
                        debug!("step result discarded, correlation already settled");
                    }
                    Err(e) => return Err(transient(e)),
                }
                self.wake_workflow(&run).await?;
                Ok(None)
            }
            Err(step_error) => {
                let exhausted = !policy.has_attempts_remaining(attempt);
                if step_error.fatal || exhausted {
                    return self.settle_step_failure(&run, &message, step_error).await;
                }

                // Retry: record, wake the workflow so it observes the
                // retrying state, and ask the queue for redelivery.
                let delay = step_error
                    .retry_after
                    .unwrap_or_else(|| policy.delay_for_attempt(attempt + 1));
                warn!(
                    step = %invocation.name,
                    correlation_id = %message.correlation_id,
                    attempt,
                    ?delay,
                    message = %step_error.message,
                    "step failed, retrying"
                );
                match self
                    .world()
                    .append_event(
                        run.run_id,
                        NewEvent::new(EventType::StepRetrying)
                            .with_correlation(message.correlation_id),
                    )
                    .await
                {
                    Ok(_) => {}
                    Err(WorldError::IllegalTransition { .. } | WorldError::RunTerminal { .. }) => {
                        return Ok(None)
                    }
                    Err(e) => return Err(transient(e)),
                }
                self.wake_workflow(&run).await?;
                Ok(Some(delay))
            }
        }
    }

    /// Runs the step body (or the built-in spawn), returning its result and
    /// the retry policy that governs it.
    async fn execute_step(
        &self,
        run_id: RunId,
        correlation_id: windlass_core::CorrelationId,
        attempt: u32,
        invocation: &StepInvocation,
    ) -> (Result<Value, StepError>, RetryPolicy) {
        if invocation.name == spawn_step_name() {
            return (
                self.execute_spawn(run_id, correlation_id, invocation).await,
                RetryPolicy::default(),
            );
        }

        let Some(registration) = self.registry().get_step(&invocation.name) else {
            return (
                Err(StepError::fatal(format!("unknown step {}", invocation.name))),
                RetryPolicy::no_retry(),
            );
        };

        let ctx = StepContext {
            run_id,
            step_name: invocation.name.clone(),
            attempt,
            max_attempts: registration.retry.max_attempts,
            args: invocation.args.clone(),
            this_val: invocation.this_val.clone(),
            closure_vars: invocation.closure_vars.clone(),
        };

        let body = registration.body.clone();
        let result = match &invocation.closure_vars {
            Some(vars) => with_closure_vars(vars.clone(), body(ctx)).await,
            None => body(ctx).await,
        };
        (result, registration.retry.clone())
    }

    /// The built-in spawn step: create the child run and return its id. The
    /// child's run id is derived from this invocation's correlation id, so a
    /// redelivered spawn finds the child already created.
    async fn execute_spawn(
        &self,
        parent_run_id: RunId,
        correlation_id: windlass_core::CorrelationId,
        invocation: &StepInvocation,
    ) -> Result<Value, StepError> {
        let (workflow, input) = payloads::decode_spawn_args(&invocation.args)
            .map_err(|e| StepError::fatal(e.to_string()))?;

        let child_id = RunId::from_ulid(correlation_id.as_ulid());

        let input = windlass_codec::dehydrate(
            &input,
            windlass_codec::Boundary::Workflow,
            "child workflow arguments",
        )
        .map_err(|e| StepError::fatal(e.to_string()))?;

        let child = self
            .start_run_serialized(&workflow, input, child_id)
            .await
            .map_err(|e| match e {
                crate::runtime::RuntimeError::UnknownWorkflow(name) => {
                    StepError::fatal(format!("unknown workflow {name}"))
                }
                other => StepError::retryable(other.to_string()),
            })?;

        debug!(parent = %parent_run_id, child = %child.run_id, "spawned child run");
        Ok(Value::object([(
            "runId",
            Value::from(child.run_id.to_string()),
        )]))
    }

    /// Appends `step_failed` with a remapped stack and wakes the workflow.
    async fn settle_step_failure(
        &self,
        run: &windlass_core::Run,
        message: &StepMessage,
        mut error: StepError,
    ) -> Result<HandlerOutcome, QueueError> {
        if let Some(stack) = &error.stack {
            error.stack = Some(self.remapper().remap(stack));
        }
        warn!(
            correlation_id = %message.correlation_id,
            message = %error.message,
            "step failed terminally"
        );

        let data = payloads::encode_step_failure(&error)
            .map_err(|e| QueueError::Handler(format!("failed to encode step failure: {e}")))?;
        match self
            .world()
            .append_event(
                run.run_id,
                NewEvent::new(EventType::StepFailed)
                    .with_correlation(message.correlation_id)
                    .with_data(data),
            )
            .await
        {
            Ok(_) => {}
            Err(WorldError::IllegalTransition { .. } | WorldError::RunTerminal { .. }) => {
                return Ok(None)
            }
            Err(e) => return Err(transient(e)),
        }
        self.wake_workflow(run).await?;
        Ok(None)
    }

    async fn wake_workflow(&self, run: &windlass_core::Run) -> Result<(), QueueError> {
        self.enqueue_workflow_message(&run.workflow_name, run.run_id)
            .await
            .map_err(|e| QueueError::Handler(e.to_string()))
    }
}
