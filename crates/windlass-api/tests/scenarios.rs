//! End-to-end scenarios against the in-memory world: full replay loops
//! through the queue, the handlers, and the client API.
//!
//! Every test runs with a paused tokio clock; queue redeliveries and retry
//! delays resolve through auto-advance (or an explicit
//! `tokio::time::advance`), so the timer scenarios are instant and
//! deterministic instead of sleeping on the wall clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use windlass_api::{Client, ClientError};
use windlass_codec::Value;
use windlass_core::{EventType, RunStatus, StepError, StepName, WorkflowName};
use windlass_engine::{Registry, Runtime};
use windlass_world::{InMemoryQueue, InMemoryWorld, World};

const RETURN_TIMEOUT: Duration = Duration::from_secs(20);

struct Host {
    runtime: Arc<Runtime>,
    client: Client,
    world: InMemoryWorld,
}

async fn host(register: impl FnOnce(&mut Registry)) -> Host {
    let world = InMemoryWorld::new();
    let queue = Arc::new(InMemoryQueue::new());
    let mut runtime = Runtime::new(Arc::new(world.clone()), queue);
    register(runtime.registry_mut());

    let runtime = Arc::new(runtime);
    Runtime::attach(&runtime).await.expect("attach");
    let client = Client::new(Arc::clone(&runtime));

    Host {
        runtime,
        client,
        world,
    }
}

async fn event_types(host: &Host, run_id: windlass_core::RunId) -> Vec<EventType> {
    host.world
        .load_events(run_id)
        .await
        .expect("events")
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

/// Lets ready queue tasks run to their next timer without advancing the
/// paused clock.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn add_ten_workflow(registry: &mut Registry) {
    let step = StepName::new("./math.ts", "add");
    registry.step(step.clone(), |ctx| async move { Ok(ctx.arg(0)) });
    registry.workflow(
        WorkflowName::new("./flows.ts", "addTen"),
        move |ctx, input| {
            let step = step.clone();
            async move {
                let x = ctx.step(&step, vec![input]).await?;
                Ok(Value::from(x.as_f64().unwrap_or(0.0) + 10.0))
            }
        },
    );
}

#[tokio::test(start_paused = true)]
async fn add_ten_produces_133_with_the_expected_event_order() {
    let host = host(add_ten_workflow).await;

    let run = host
        .client
        .start(&WorkflowName::new("./flows.ts", "addTen"), Value::from(123.0))
        .await
        .expect("start");

    let output = run.return_value(RETURN_TIMEOUT).await.expect("output");
    assert_eq!(output, Value::from(133.0));

    assert_eq!(
        event_types(&host, run.run_id()).await,
        vec![
            EventType::RunCreated,
            EventType::RunStarted,
            EventType::StepCreated,
            EventType::StepStarted,
            EventType::StepCompleted,
            EventType::RunCompleted,
        ]
    );

    // The stored record carries the serialized output too.
    let record = run.get().await.expect("record");
    assert_eq!(record.status, RunStatus::Completed);
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn parallel_steps_concatenate_in_argument_order() {
    let host = host(|registry| {
        let step = StepName::new("./letters.ts", "letter");
        registry.step(step.clone(), |ctx| async move {
            // Finish in reverse argument order to scramble log order.
            let delay = match ctx.arg(0).as_str() {
                Some("A") => 60,
                Some("B") => 30,
                _ => 5,
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(ctx.arg(0))
        });
        registry.workflow(
            WorkflowName::new("./flows.ts", "promiseAll"),
            move |ctx, input| {
                let step = step.clone();
                async move {
                    let labels = match input {
                        Value::Array(items) => items,
                        other => vec![other],
                    };
                    let futures: Vec<_> = labels
                        .iter()
                        .map(|label| ctx.step(&step, vec![label.clone()]))
                        .collect();
                    let results = futures::future::join_all(futures).await;

                    let mut out = String::new();
                    for result in results {
                        out.push_str(result?.as_str().unwrap_or(""));
                    }
                    Ok(Value::from(out))
                }
            },
        );
    })
    .await;

    let input = Value::array([Value::from("A"), Value::from("B"), Value::from("C")]);
    let run = host
        .client
        .start(&WorkflowName::new("./flows.ts", "promiseAll"), input)
        .await
        .expect("start");

    let output = run.return_value(RETURN_TIMEOUT).await.expect("output");
    assert_eq!(output, Value::from("ABC"));

    let types = event_types(&host, run.run_id()).await;
    assert_eq!(
        types
            .iter()
            .filter(|t| **t == EventType::StepCompleted)
            .count(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn sleep_suspends_and_resumes_after_the_wake_time() {
    let host = host(|registry| {
        registry.workflow(
            WorkflowName::new("./flows.ts", "nap"),
            |ctx, _input| async move {
                ctx.sleep(Duration::from_millis(800)).await;
                Ok(Value::from("woke"))
            },
        );
    })
    .await;

    let started = Instant::now();
    let run = host
        .client
        .start(&WorkflowName::new("./flows.ts", "nap"), Value::Null)
        .await
        .expect("start");

    let output = run.return_value(RETURN_TIMEOUT).await.expect("output");
    assert_eq!(output, Value::from("woke"));
    assert!(
        started.elapsed() >= Duration::from_millis(800),
        "woke too early: {:?}",
        started.elapsed()
    );

    assert_eq!(
        event_types(&host, run.run_id()).await,
        vec![
            EventType::RunCreated,
            EventType::RunStarted,
            EventType::WaitCreated,
            EventType::WaitCompleted,
            EventType::RunCompleted,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn hook_delivers_three_payloads_in_order() {
    let host = host(|registry| {
        registry.workflow(
            WorkflowName::new("./flows.ts", "mailbox"),
            |ctx, _input| async move {
                let hook = ctx.hook("order-7");
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
            },
        );
    })
    .await;

    let run = host
        .client
        .start(&WorkflowName::new("./flows.ts", "mailbox"), Value::Null)
        .await
        .expect("start");

    // The token becomes deliverable once the first pass records the hook.
    let payload = |text: &str, done: bool| {
        Value::object([("body", Value::from(text)), ("done", Value::Bool(done))])
    };
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match host.client.deliver_hook("order-7", payload("m1", false)).await {
            Ok(_) => break,
            Err(_) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("hook never became deliverable: {e}"),
        }
    }
    host.client
        .deliver_hook("order-7", payload("m2", false))
        .await
        .expect("deliver m2");
    host.client
        .deliver_hook("order-7", payload("m3", true))
        .await
        .expect("deliver m3");

    let output = run.return_value(RETURN_TIMEOUT).await.expect("output");
    let Value::Array(items) = output else {
        panic!("expected array output");
    };
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].get("body"), Some(&Value::from("m1")));
    assert_eq!(items[1].get("body"), Some(&Value::from("m2")));
    assert_eq!(items[2].get("body"), Some(&Value::from("m3")));

    let types = event_types(&host, run.run_id()).await;
    let count = |t: EventType| types.iter().filter(|e| **e == t).count();
    assert_eq!(count(EventType::HookCreated), 1);
    assert_eq!(count(EventType::HookReceived), 3);
    assert_eq!(count(EventType::HookDisposed), 1);
}

#[tokio::test(start_paused = true)]
async fn retryable_step_succeeds_on_the_third_attempt() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in_step = Arc::clone(&attempts);

    let host = host(move |registry| {
        let step = StepName::new("./net.ts", "flaky");
        registry.step_with_retry(
            step.clone(),
            windlass_core::RetryPolicy::fixed(Duration::from_millis(10), 5),
            move |_ctx| {
                let attempts = Arc::clone(&attempts_in_step);
                async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt < 3 {
                        Err(StepError::retryable("connection reset")
                            .with_retry_after(Duration::from_millis(10)))
                    } else {
                        Ok(Value::object([
                            ("ok", Value::Bool(true)),
                            ("attempt", Value::from(f64::from(attempt))),
                        ]))
                    }
                }
            },
        );
        registry.workflow(
            WorkflowName::new("./flows.ts", "withRetry"),
            move |ctx, _input| {
                let step = step.clone();
                async move { ctx.step(&step, vec![]).await }
            },
        );
    })
    .await;

    let run = host
        .client
        .start(&WorkflowName::new("./flows.ts", "withRetry"), Value::Null)
        .await
        .expect("start");

    let output = run.return_value(RETURN_TIMEOUT).await.expect("output");
    assert_eq!(output.get("ok"), Some(&Value::Bool(true)));
    assert_eq!(output.get("attempt").and_then(Value::as_i64), Some(3));

    let types: Vec<EventType> = event_types(&host, run.run_id()).await
        .into_iter()
        .filter(|t| {
            matches!(
                t,
                EventType::StepCreated
                    | EventType::StepStarted
                    | EventType::StepRetrying
                    | EventType::StepCompleted
                    | EventType::StepFailed
            )
        })
        .collect();
    assert_eq!(
        types,
        vec![
            EventType::StepCreated,
            EventType::StepStarted,
            EventType::StepRetrying,
            EventType::StepStarted,
            EventType::StepRetrying,
            EventType::StepStarted,
            EventType::StepCompleted,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn fatal_step_error_fails_the_run_with_the_original_message() {
    let host = host(|registry| {
        let step = StepName::new("./billing.ts", "charge");
        registry.step(step.clone(), |_ctx| async move {
            Err::<Value, _>(StepError::fatal("card number is invalid"))
        });
        registry.workflow(
            WorkflowName::new("./flows.ts", "charge"),
            move |ctx, _input| {
                let step = step.clone();
                async move { ctx.step(&step, vec![]).await }
            },
        );
    })
    .await;

    let run = host
        .client
        .start(&WorkflowName::new("./flows.ts", "charge"), Value::Null)
        .await
        .expect("start");

    let error = run.return_value(RETURN_TIMEOUT).await.unwrap_err();
    match error {
        ClientError::RunFailed(failure) => {
            assert!(failure.message.contains("card number is invalid"));
        }
        other => panic!("expected run failure, got {other}"),
    }

    let types = event_types(&host, run.run_id()).await;
    assert!(types.contains(&EventType::StepFailed));
    assert!(types.contains(&EventType::RunFailed));
    assert!(!types.contains(&EventType::StepRetrying));
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_performs_no_further_appends() {
    let host = host(|registry| {
        registry.workflow(
            WorkflowName::new("./flows.ts", "slow"),
            |ctx, _input| async move {
                ctx.sleep(Duration::from_secs(2)).await;
                Ok(Value::Null)
            },
        );
    })
    .await;

    let run = host
        .client
        .start(&WorkflowName::new("./flows.ts", "slow"), Value::Null)
        .await
        .expect("start");

    // Let the first pass record the wait, then cancel before the wake time.
    settle().await;
    let status = run.cancel().await.expect("cancel");
    assert_eq!(status, RunStatus::Cancelled);

    let before = event_types(&host, run.run_id()).await;
    assert_eq!(before.last(), Some(&EventType::RunCancelled));

    // Advance past the wake time: the queue redelivers the suspended
    // workflow message, and the handler must see the cancelled run and
    // append nothing.
    tokio::time::advance(Duration::from_secs(3)).await;
    settle().await;

    assert_eq!(event_types(&host, run.run_id()).await, before);
    let record = run.get().await.expect("record");
    assert_eq!(record.status, RunStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn spawned_child_workflow_completes_independently() {
    let host = host(|registry| {
        registry.workflow(
            WorkflowName::new("./flows.ts", "double"),
            |_ctx, input| async move {
                Ok(Value::from(input.as_f64().unwrap_or(0.0) * 2.0))
            },
        );
        registry.workflow(
            WorkflowName::new("./flows.ts", "parent"),
            |ctx, input| async move {
                let child = ctx
                    .spawn(&WorkflowName::new("./flows.ts", "double"), input)
                    .await?;
                Ok(Value::from(child.to_string()))
            },
        );
    })
    .await;

    let run = host
        .client
        .start(&WorkflowName::new("./flows.ts", "parent"), Value::from(21.0))
        .await
        .expect("start");

    let output = run.return_value(RETURN_TIMEOUT).await.expect("output");
    let child_id: windlass_core::RunId = output
        .as_str()
        .expect("child run id")
        .parse()
        .expect("parse run id");

    let child = host.client.run(child_id);
    let child_output = child.return_value(RETURN_TIMEOUT).await.expect("child output");
    assert_eq!(child_output, Value::from(42.0));
}

#[tokio::test(start_paused = true)]
async fn redelivered_workflow_messages_do_not_duplicate_created_events() {
    let host = host(|registry| {
        registry.workflow(
            WorkflowName::new("./flows.ts", "inbox"),
            |ctx, _input| async move {
                let hook = ctx.hook("inbox-1");
                let payload = hook.next().await;
                hook.dispose();
                Ok(payload.unwrap_or(Value::Null))
            },
        );
    })
    .await;

    let run = host
        .client
        .start(&WorkflowName::new("./flows.ts", "inbox"), Value::Null)
        .await
        .expect("start");

    // Hammer the workflow topic while the run is suspended on the hook;
    // every redelivered pass sees the hook already created.
    let topic = WorkflowName::new("./flows.ts", "inbox").topic();
    for _ in 0..5 {
        host.runtime
            .queue()
            .enqueue(
                &topic,
                &run.run_id().to_string(),
                windlass_engine::WorkflowMessage::new(run.run_id())
                    .to_bytes()
                    .expect("encode"),
            )
            .await
            .expect("enqueue");
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    host.client
        .deliver_hook("inbox-1", Value::from("payload"))
        .await
        .expect("deliver");
    let output = run.return_value(RETURN_TIMEOUT).await.expect("output");
    assert_eq!(output, Value::from("payload"));

    let types = event_types(&host, run.run_id()).await;
    let created = types
        .iter()
        .filter(|t| t.is_correlation_created())
        .count();
    assert_eq!(created, 1, "exactly one hook_created despite redeliveries");
}

#[tokio::test(start_paused = true)]
async fn run_handle_timestamps_follow_status() {
    let host = host(add_ten_workflow).await;

    let run = host
        .client
        .start(&WorkflowName::new("./flows.ts", "addTen"), Value::from(1.0))
        .await
        .expect("start");

    run.return_value(RETURN_TIMEOUT).await.expect("output");
    let (created, started, completed) = run.timestamps().await.expect("timestamps");
    let started = started.expect("terminal run has started_at");
    let completed = completed.expect("terminal run has completed_at");
    assert!(created <= started);
    assert!(started <= completed);
}
