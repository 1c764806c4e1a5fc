//! The deterministic replay pass.
//!
//! The engine is a pure reducer over the event log: given the workflow
//! function, the run record, and the run's correlation events in append
//! order, it re-executes user code and decides whether the run completed,
//! failed, or suspended. No I/O happens here; the handlers around the engine
//! own every durable side effect.
//!
//! The reference implementation signalled "no more events" by throwing; this
//! engine returns the equivalent [`ReplayOutcome`] sum type — the
//! event-sourced semantics are identical.

use std::cell::RefCell;
use std::rc::Rc;
use std::task::{Context, Poll};

use tracing::{debug, trace};

use windlass_codec::{hydrate_versioned, Boundary, CodecError, Value};
use windlass_core::{
    CorrelationId, Event, EventType, IdSource, Run, StepName, WorkflowError, WorkflowName,
};

use crate::consumer::{EventsConsumer, Verdict};
use crate::pending::{PendingCounts, PendingQueue};
use crate::registry::WorkflowFn;
use crate::state::{EngineCore, EngineState, SharedState};
use crate::WorkflowContext;

/// Fatal engine/runtime errors: the log contradicts the code being replayed.
/// Terminal; the workflow handler surfaces them as `run_failed`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An event type that is illegal for its correlation's state.
    #[error("unexpected {event_type} for correlation {correlation_id}")]
    UnexpectedEvent {
        correlation_id: CorrelationId,
        event_type: EventType,
    },

    /// An event no live primitive claims; the log references work the code
    /// never reaches.
    #[error("event {event_type} (correlation {correlation_id:?}) was not consumed by any primitive")]
    UnconsumedEvent {
        event_type: EventType,
        correlation_id: Option<CorrelationId>,
    },

    /// The workflow future is pending with no durable primitive awaited —
    /// user code awaited something the engine does not control.
    #[error(
        "workflow is pending without a durable primitive; only steps, waits, \
         hooks and spawned runs may be awaited in workflow code"
    )]
    StalledWorkflow,

    /// No registered workflow under this name.
    #[error("unknown workflow {0}")]
    UnknownWorkflow(WorkflowName),

    /// No registered step under this name.
    #[error("unknown step {0}")]
    UnknownStep(StepName),

    /// A boundary payload failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// How a replay pass ended.
#[derive(Debug)]
pub enum ReplayOutcome {
    /// The workflow function returned; the value is its hydrated result.
    Completed(Value),

    /// The log is exhausted and user code awaits unresolved primitives.
    Suspended,

    /// User code threw.
    Failed(WorkflowError),
}

/// Outcome plus the durable side effects the handlers must apply.
#[derive(Debug)]
pub struct ReplayReport {
    pub outcome: ReplayOutcome,

    /// Pending-work queue snapshot at the end of the pass.
    pub pending: PendingQueue,

    /// Per-family counts of the pending queue (logged with suspensions).
    pub counts: PendingCounts,

    /// Hook correlations whose disposal user code requested this pass.
    pub disposals: Vec<CorrelationId>,
}

/// Replays a run. `events` must be the run's correlation events (run-level
/// events carry no replay information) in append order.
pub fn replay(
    workflow: &WorkflowFn,
    run: &Run,
    events: Vec<Event>,
) -> Result<ReplayReport, EngineError> {
    let started_at = run.started_at.unwrap_or(run.created_at);
    let state: SharedState = Rc::new(RefCell::new(EngineState {
        core: EngineCore {
            spec_version: run.spec_version,
            ids: IdSource::seeded_for_run(&run.run_id, started_at),
            pending: PendingQueue::new(),
            disposals: Vec::new(),
            corruption: None,
        },
        subs: Vec::new(),
    }));

    let input = hydrate_versioned(
        &run.input,
        run.spec_version,
        Boundary::Workflow,
        "workflow arguments",
    )?;

    let ctx = WorkflowContext::new(Rc::clone(&state), run.run_id);
    let mut future = workflow(ctx, input);

    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut consumer = EventsConsumer::new(events);

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(result) => {
                debug!(run_id = %run.run_id, "workflow function returned");
                let (pending, disposals) = snapshot(&state);
                let counts = pending.counts();
                let outcome = match result {
                    Ok(value) => ReplayOutcome::Completed(value),
                    Err(error) => ReplayOutcome::Failed(error),
                };
                return Ok(ReplayReport {
                    outcome,
                    pending,
                    counts,
                    disposals,
                });
            }
            Poll::Pending => {
                if let Some(err) = take_corruption(&state) {
                    return Err(err);
                }

                let Some(event) = consumer.peek().cloned() else {
                    // End of log. Anything still subscribed must suspend.
                    let (pending, disposals) = snapshot(&state);
                    let has_subscribers = !state.borrow().subs.is_empty();
                    if !has_subscribers && pending.is_empty() {
                        return Err(EngineError::StalledWorkflow);
                    }
                    let counts = pending.counts();
                    debug!(
                        run_id = %run.run_id,
                        steps = counts.steps,
                        hooks = counts.hooks,
                        waits = counts.waits,
                        runs = counts.runs,
                        "replay suspended"
                    );
                    return Ok(ReplayReport {
                        outcome: ReplayOutcome::Suspended,
                        pending,
                        counts,
                        disposals,
                    });
                };

                let consumed = deliver(&state, &event);
                if let Some(err) = take_corruption(&state) {
                    return Err(err);
                }
                if consumed {
                    trace!(event_type = %event.event_type, "event consumed");
                    state.borrow_mut().core.ids.set_clock(event.created_at);
                    consumer.advance();
                } else {
                    return Err(EngineError::UnconsumedEvent {
                        event_type: event.event_type,
                        correlation_id: event.correlation_id,
                    });
                }
            }
        }
    }
}

/// Offers one event to the subscribers in registration order. Returns whether
/// anyone consumed it.
fn deliver(state: &SharedState, event: &Event) -> bool {
    let mut st = state.borrow_mut();
    let st = &mut *st;

    let mut finished = None;
    let mut consumed = false;
    for (i, sub) in st.subs.iter_mut().enumerate() {
        match (sub.handler)(event, &mut st.core) {
            Verdict::NotConsumed => continue,
            Verdict::Consumed => {
                consumed = true;
                break;
            }
            Verdict::Finished => {
                consumed = true;
                finished = Some(i);
                break;
            }
        }
    }
    if let Some(i) = finished {
        st.subs.remove(i);
    }
    consumed
}

fn take_corruption(state: &SharedState) -> Option<EngineError> {
    state.borrow_mut().core.corruption.take()
}

fn snapshot(state: &SharedState) -> (PendingQueue, Vec<CorrelationId>) {
    let st = state.borrow();
    (st.core.pending.clone(), st.core.disposals.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use futures::FutureExt;

    use windlass_codec::dehydrate;
    use windlass_core::{EventId, RunStatus, StepName};

    use crate::payloads;
    use crate::pending::PendingWork;

    fn workflow_fn<F, Fut>(f: F) -> WorkflowFn
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + 'static,
    {
        Arc::new(move |ctx, input| f(ctx, input).boxed_local())
    }

    fn running_run(input: Value) -> Run {
        let input = dehydrate(&input, Boundary::Client, "workflow arguments").expect("encode");
        let mut run = Run::new(
            windlass_core::RunId::new(),
            WorkflowName::new("./flows.ts", "test"),
            input,
        );
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        run
    }

    fn event(
        run: &Run,
        event_type: EventType,
        correlation_id: CorrelationId,
        data: Option<Vec<u8>>,
    ) -> Event {
        Event {
            event_id: EventId::new(),
            run_id: run.run_id,
            event_type,
            correlation_id: Some(correlation_id),
            created_at: Utc::now(),
            spec_version: run.spec_version,
            event_data: data,
        }
    }

    fn add_ten() -> WorkflowFn {
        workflow_fn(|ctx, input| async move {
            let step = StepName::new("./math.ts", "add");
            let x = ctx.step(&step, vec![input]).await?;
            Ok(Value::from(x.as_f64().unwrap_or(0.0) + 10.0))
        })
    }

    #[test]
    fn first_pass_suspends_with_pending_step() {
        let run = running_run(Value::from(123.0));
        let report = replay(&add_ten(), &run, vec![]).expect("replay");

        assert!(matches!(report.outcome, ReplayOutcome::Suspended));
        assert_eq!(report.counts.steps, 1);
        assert_eq!(report.pending.len(), 1);

        let (correlation_id, work) = report.pending.iter().next().expect("pending item");
        assert_eq!(
            correlation_id.family(),
            windlass_core::PrimitiveFamily::Step
        );
        match work {
            PendingWork::Step(step) => {
                assert_eq!(step.name, StepName::new("./math.ts", "add"));
                assert_eq!(step.args, vec![Value::from(123.0)]);
                assert!(!step.has_created_event);
            }
            other => panic!("expected pending step, got {other:?}"),
        }
    }

    #[test]
    fn replay_is_deterministic() {
        let run = running_run(Value::from(1.0));
        let workflow = add_ten();

        let a = replay(&workflow, &run, vec![]).expect("replay");
        let b = replay(&workflow, &run, vec![]).expect("replay");

        let ids_a: Vec<_> = a.pending.iter().map(|(id, _)| *id).collect();
        let ids_b: Vec<_> = b.pending.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids_a, ids_b);
        assert_eq!(a.pending, b.pending);
    }

    #[test]
    fn completes_once_the_log_resolves_the_step() {
        let run = running_run(Value::from(123.0));
        let workflow = add_ten();

        let first = replay(&workflow, &run, vec![]).expect("replay");
        let (correlation_id, _) = first.pending.iter().next().expect("pending");
        let correlation_id = *correlation_id;

        let events = vec![
            event(&run, EventType::StepCreated, correlation_id, None),
            event(&run, EventType::StepStarted, correlation_id, None),
            event(
                &run,
                EventType::StepCompleted,
                correlation_id,
                Some(payloads::encode_step_result(&Value::from(123.0)).expect("encode")),
            ),
        ];

        let report = replay(&workflow, &run, events).expect("replay");
        match report.outcome {
            ReplayOutcome::Completed(value) => assert_eq!(value, Value::from(133.0)),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(report.pending.is_empty());
    }

    #[test]
    fn created_event_marks_pending_item() {
        let run = running_run(Value::from(1.0));
        let workflow = add_ten();

        let first = replay(&workflow, &run, vec![]).expect("replay");
        let (correlation_id, _) = first.pending.iter().next().expect("pending");
        let events = vec![event(&run, EventType::StepCreated, *correlation_id, None)];

        let report = replay(&workflow, &run, events).expect("replay");
        assert!(matches!(report.outcome, ReplayOutcome::Suspended));
        let (_, work) = report.pending.iter().next().expect("still pending");
        assert!(work.has_created_event());
    }

    #[test]
    fn step_failure_rejects_the_await() {
        let run = running_run(Value::Null);
        let workflow = workflow_fn(|ctx, _input| async move {
            let step = StepName::new("./math.ts", "explode");
            match ctx.step(&step, vec![]).await {
                Ok(_) => Ok(Value::from("unexpected")),
                Err(error) => Ok(Value::from(format!("caught: {}", error.message))),
            }
        });

        let first = replay(&workflow, &run, vec![]).expect("replay");
        let (correlation_id, _) = first.pending.iter().next().expect("pending");
        let failure = windlass_core::StepError::fatal("division by zero")
            .with_stack("at explode (./math.ts:9:1)");
        let events = vec![
            event(&run, EventType::StepCreated, *correlation_id, None),
            event(&run, EventType::StepStarted, *correlation_id, None),
            event(
                &run,
                EventType::StepFailed,
                *correlation_id,
                Some(payloads::encode_step_failure(&failure).expect("encode")),
            ),
        ];

        let report = replay(&workflow, &run, events).expect("replay");
        match report.outcome {
            ReplayOutcome::Completed(value) => {
                assert_eq!(value, Value::from("caught: division by zero"))
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn parallel_steps_join_in_argument_order() {
        let run = running_run(Value::Null);
        let workflow = workflow_fn(|ctx, _input| async move {
            let step = StepName::new("./letters.ts", "letter");
            let futures: Vec<_> = ["a", "b", "c"]
                .iter()
                .map(|label| ctx.step(&step, vec![Value::from(*label)]))
                .collect();
            let results = futures::future::join_all(futures).await;

            let mut out = String::new();
            for result in results {
                out.push_str(result?.as_str().unwrap_or(""));
            }
            Ok(Value::from(out))
        });

        let first = replay(&workflow, &run, vec![]).expect("replay");
        assert_eq!(first.counts.steps, 3);
        let ids: Vec<_> = first.pending.iter().map(|(id, _)| *id).collect();

        // Resolve out of order: B, C, then A.
        let mut events = Vec::new();
        for id in &ids {
            events.push(event(&run, EventType::StepCreated, *id, None));
            events.push(event(&run, EventType::StepStarted, *id, None));
        }
        for (idx, payload) in [(1usize, "B"), (2, "C"), (0, "A")] {
            events.push(event(
                &run,
                EventType::StepCompleted,
                ids[idx],
                Some(payloads::encode_step_result(&Value::from(payload)).expect("encode")),
            ));
        }

        let report = replay(&workflow, &run, events).expect("replay");
        match report.outcome {
            ReplayOutcome::Completed(value) => assert_eq!(value, Value::from("ABC")),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn sleep_records_wake_time_and_resumes() {
        let run = running_run(Value::Null);
        let workflow = workflow_fn(|ctx, _input| async move {
            ctx.sleep(Duration::from_secs(10)).await;
            Ok(Value::from("woke"))
        });

        let first = replay(&workflow, &run, vec![]).expect("replay");
        assert!(matches!(first.outcome, ReplayOutcome::Suspended));
        assert_eq!(first.counts.waits, 1);

        let (correlation_id, work) = first.pending.iter().next().expect("pending wait");
        let resume_at = match work {
            PendingWork::Wait(wait) => wait.resume_at,
            other => panic!("expected wait, got {other:?}"),
        };
        let expected = run.started_at.expect("started") + chrono::Duration::seconds(10);
        assert_eq!(resume_at.timestamp(), expected.timestamp());

        let events = vec![
            event(
                &run,
                EventType::WaitCreated,
                *correlation_id,
                Some(payloads::encode_wait_created(resume_at).expect("encode")),
            ),
            event(&run, EventType::WaitCompleted, *correlation_id, None),
        ];
        let report = replay(&workflow, &run, events).expect("replay");
        assert!(matches!(
            report.outcome,
            ReplayOutcome::Completed(ref v) if *v == Value::from("woke")
        ));
    }

    #[test]
    fn hook_collects_payloads_and_requests_disposal() {
        let run = running_run(Value::Null);
        let workflow = workflow_fn(|ctx, _input| async move {
            let hook = ctx.hook("order-42");
            let mut collected = Vec::new();
            while let Some(payload) = hook.next().await {
                let done = payload
                    .get("done")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                collected.push(payload);
                if done {
                    break;
                }
            }
            hook.dispose();
            Ok(Value::Array(collected))
        });

        let first = replay(&workflow, &run, vec![]).expect("replay");
        assert_eq!(first.counts.hooks, 1);
        let (correlation_id, _) = first.pending.iter().next().expect("pending hook");
        let correlation_id = *correlation_id;

        let payload = |text: &str, done: bool| {
            payloads::encode_hook_payload(&Value::object([
                ("body", Value::from(text)),
                ("done", Value::Bool(done)),
            ]))
            .expect("encode")
        };
        let events = vec![
            event(
                &run,
                EventType::HookCreated,
                correlation_id,
                Some(payloads::encode_hook_created("order-42", None, None).expect("encode")),
            ),
            event(&run, EventType::HookReceived, correlation_id, Some(payload("m1", false))),
            event(&run, EventType::HookReceived, correlation_id, Some(payload("m2", false))),
            event(&run, EventType::HookReceived, correlation_id, Some(payload("m3", true))),
        ];

        let report = replay(&workflow, &run, events).expect("replay");
        match &report.outcome {
            ReplayOutcome::Completed(Value::Array(items)) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[0].get("body"), Some(&Value::from("m1")));
                assert_eq!(items[2].get("done"), Some(&Value::Bool(true)));
            }
            other => panic!("expected array completion, got {other:?}"),
        }
        assert_eq!(report.disposals, vec![correlation_id]);
    }

    #[test]
    fn unexpected_event_type_is_corruption() {
        let run = running_run(Value::from(1.0));
        let workflow = add_ten();

        let first = replay(&workflow, &run, vec![]).expect("replay");
        let (correlation_id, _) = first.pending.iter().next().expect("pending");

        // A wait event on a step correlation is log corruption.
        let events = vec![event(&run, EventType::WaitCompleted, *correlation_id, None)];
        let err = replay(&workflow, &run, events).unwrap_err();
        assert!(matches!(err, EngineError::UnexpectedEvent { .. }));
    }

    #[test]
    fn event_for_unknown_correlation_is_corruption() {
        let run = running_run(Value::from(1.0));
        let workflow = add_ten();

        let stranger = CorrelationId::step(ulid::Ulid::new());
        let events = vec![event(&run, EventType::StepCreated, stranger, None)];
        let err = replay(&workflow, &run, events).unwrap_err();
        assert!(matches!(err, EngineError::UnconsumedEvent { .. }));
    }

    #[test]
    fn non_durable_await_is_rejected() {
        let run = running_run(Value::Null);
        let workflow = workflow_fn(|_ctx, _input| async move {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        });

        let err = replay(&workflow, &run, vec![]).unwrap_err();
        assert!(matches!(err, EngineError::StalledWorkflow));
    }

    #[test]
    fn unreadable_input_is_a_codec_error() {
        let mut run = running_run(Value::Null);
        run.input = b"junkdata".to_vec();
        let err = replay(&add_ten(), &run, vec![]).unwrap_err();
        assert!(matches!(err, EngineError::Codec(_)));
    }

    #[test]
    fn spawn_registers_a_pending_run() {
        let run = running_run(Value::Null);
        let workflow = workflow_fn(|ctx, _input| async move {
            let child = ctx
                .spawn(&WorkflowName::new("./flows.ts", "child"), Value::from(7.0))
                .await?;
            Ok(Value::from(child.to_string()))
        });

        let first = replay(&workflow, &run, vec![]).expect("replay");
        assert!(matches!(first.outcome, ReplayOutcome::Suspended));
        assert_eq!(first.counts.runs, 1);

        let (correlation_id, work) = first.pending.iter().next().expect("pending spawn");
        match work {
            PendingWork::Run(spawn) => {
                assert_eq!(spawn.workflow_name, WorkflowName::new("./flows.ts", "child"));
                assert_eq!(spawn.input, Value::from(7.0));
            }
            other => panic!("expected pending run, got {other:?}"),
        }

        // Resolving the spawn step yields the child run id.
        let child_id = windlass_core::RunId::from_ulid(correlation_id.as_ulid());
        let result = Value::object([("runId", Value::from(child_id.to_string()))]);
        let events = vec![
            event(&run, EventType::StepCreated, *correlation_id, None),
            event(&run, EventType::StepStarted, *correlation_id, None),
            event(
                &run,
                EventType::StepCompleted,
                *correlation_id,
                Some(payloads::encode_step_result(&result).expect("encode")),
            ),
        ];
        let report = replay(&workflow, &run, events).expect("replay");
        match report.outcome {
            ReplayOutcome::Completed(value) => {
                assert_eq!(value, Value::from(child_id.to_string()))
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn replay_clock_follows_consumed_events() {
        let run = running_run(Value::Null);
        let workflow = workflow_fn(|ctx, _input| async move {
            let step = StepName::new("./time.ts", "tick");
            ctx.step(&step, vec![]).await?;
            Ok(Value::Date(ctx.now()))
        });

        let first = replay(&workflow, &run, vec![]).expect("replay");
        let (correlation_id, _) = first.pending.iter().next().expect("pending");

        let completed_at = Utc::now() + chrono::Duration::seconds(90);
        let mut completed = event(
            &run,
            EventType::StepCompleted,
            *correlation_id,
            Some(payloads::encode_step_result(&Value::Null).expect("encode")),
        );
        completed.created_at = completed_at;

        let events = vec![
            event(&run, EventType::StepCreated, *correlation_id, None),
            event(&run, EventType::StepStarted, *correlation_id, None),
            completed,
        ];
        let report = replay(&workflow, &run, events).expect("replay");
        match report.outcome {
            ReplayOutcome::Completed(Value::Date(at)) => {
                assert_eq!(at.timestamp(), completed_at.timestamp());
            }
            other => panic!("expected date completion, got {other:?}"),
        }
    }
}
