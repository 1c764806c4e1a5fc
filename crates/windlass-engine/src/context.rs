//! The workflow-facing API: durable primitives.
//!
//! A [`WorkflowContext`] is handed to the workflow function on every replay
//! pass. Each primitive allocates a deterministic correlation id, records a
//! pending-work item, and subscribes to the events consumer; its future
//! resolves only from the event log. Awaiting a primitive whose events have
//! not arrived leaves the future pending, which is what suspends the pass.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};

use windlass_codec::{StepReference, Value};
use windlass_core::{
    CorrelationId, Event, EventType, PrimitiveFamily, RunId, StepName, WorkflowError, WorkflowName,
};

use crate::consumer::Verdict;
use crate::engine::EngineError;
use crate::payloads;
use crate::pending::{PendingHook, PendingRun, PendingStep, PendingWait, PendingWork};
use crate::state::{EngineCore, SharedState, Subscription};

type StepSlot = Rc<RefCell<Option<Result<Value, WorkflowError>>>>;

/// Options for a step invocation.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Receiver to restore as `this` when the step was invoked as a method.
    pub this_val: Option<Value>,

    /// Captured closure variables, made available to the step body in a
    /// task-local scope.
    pub closure_vars: Option<Value>,
}

/// Options for a hook.
#[derive(Debug, Clone, Default)]
pub struct HookOptions {
    /// Static response returned to webhook callers by the host.
    pub static_response: Option<Value>,

    /// Opaque metadata recorded on `hook_created`.
    pub metadata: Option<Value>,
}

/// Handle to the durable primitives of one run, valid for one replay pass.
#[derive(Clone)]
pub struct WorkflowContext {
    state: SharedState,
    run_id: RunId,
}

impl WorkflowContext {
    pub(crate) fn new(state: SharedState, run_id: RunId) -> Self {
        Self { state, run_id }
    }

    /// The run being executed.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The deterministic replay clock: the timestamp of the event most
    /// recently consumed from the log.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.state.borrow().core.ids.clock()
    }

    /// Invokes a step. The returned future resolves with the step's durable
    /// result; the invocation is recorded the first time this pass suspends.
    pub fn step(&self, name: &StepName, args: Vec<Value>) -> StepFuture {
        self.step_with(name, args, StepOptions::default())
    }

    /// Invokes a step with an explicit receiver or closure variables.
    pub fn step_with(&self, name: &StepName, args: Vec<Value>, options: StepOptions) -> StepFuture {
        let mut st = self.state.borrow_mut();
        let correlation = st.core.ids.correlation(PrimitiveFamily::Step);
        st.core.pending.insert(
            correlation,
            PendingWork::Step(PendingStep {
                name: name.clone(),
                args,
                this_val: options.this_val,
                closure_vars: options.closure_vars,
                has_created_event: false,
            }),
        );

        let slot: StepSlot = Rc::new(RefCell::new(None));
        st.subs.push(Subscription {
            handler: step_subscription(correlation, Rc::clone(&slot)),
        });
        StepFuture { slot }
    }

    /// Invokes a revived step-function reference, carrying its captured
    /// closure variables across the boundary.
    pub fn call(&self, reference: &StepReference, args: Vec<Value>) -> StepFuture {
        self.step_with(
            &reference.step_id,
            args,
            StepOptions {
                this_val: None,
                closure_vars: reference.closure_vars.as_deref().cloned(),
            },
        )
    }

    /// Durable delay. Resolves once a `wait_completed` event exists, i.e.
    /// after the queue redelivers the run at the recorded wake time.
    pub fn sleep(&self, duration: Duration) -> WaitFuture {
        let mut st = self.state.borrow_mut();
        let resume_at = st.core.ids.clock()
            + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        let correlation = st.core.ids.correlation(PrimitiveFamily::Wait);
        st.core.pending.insert(
            correlation,
            PendingWork::Wait(PendingWait {
                resume_at,
                has_created_event: false,
            }),
        );

        let slot = Rc::new(RefCell::new(false));
        st.subs.push(Subscription {
            handler: wait_subscription(correlation, Rc::clone(&slot)),
        });
        WaitFuture { slot }
    }

    /// Opens a named mailbox. External callers deliver payloads by token;
    /// each delivery resolves one [`Hook::next`] await, in arrival order.
    pub fn hook(&self, token: impl Into<String>) -> Hook {
        self.hook_with(token, HookOptions::default())
    }

    /// Opens a hook with host-facing options.
    pub fn hook_with(&self, token: impl Into<String>, options: HookOptions) -> Hook {
        let token = token.into();
        let mut st = self.state.borrow_mut();
        let correlation = st.core.ids.correlation(PrimitiveFamily::Hook);
        st.core.pending.insert(
            correlation,
            PendingWork::Hook(PendingHook {
                token: token.clone(),
                static_response: options.static_response,
                metadata: options.metadata,
                has_created_event: false,
            }),
        );

        let buffer = Rc::new(RefCell::new(HookBuffer {
            received: VecDeque::new(),
            disposed: false,
        }));
        st.subs.push(Subscription {
            handler: hook_subscription(correlation, Rc::clone(&buffer)),
        });

        Hook {
            state: Rc::clone(&self.state),
            correlation,
            token,
            buffer,
        }
    }

    /// Spawns a child workflow through the built-in spawn step; only the
    /// child's run id crosses back.
    pub async fn spawn(
        &self,
        workflow: &WorkflowName,
        input: Value,
    ) -> Result<RunId, WorkflowError> {
        let future = {
            let mut st = self.state.borrow_mut();
            let correlation = st.core.ids.correlation(PrimitiveFamily::Step);
            st.core.pending.insert(
                correlation,
                PendingWork::Run(PendingRun {
                    workflow_name: workflow.clone(),
                    input,
                    has_created_event: false,
                }),
            );

            let slot: StepSlot = Rc::new(RefCell::new(None));
            st.subs.push(Subscription {
                handler: step_subscription(correlation, Rc::clone(&slot)),
            });
            StepFuture { slot }
        };

        let value = future.await?;
        value
            .get("runId")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| WorkflowError::new("spawned run returned no runId"))
    }
}

/// Future for a step result.
pub struct StepFuture {
    slot: StepSlot,
}

impl Future for StepFuture {
    type Output = Result<Value, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.slot.borrow_mut().take() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

/// Future for a durable delay.
pub struct WaitFuture {
    slot: Rc<RefCell<bool>>,
}

impl Future for WaitFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if *self.slot.borrow() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

pub(crate) struct HookBuffer {
    received: VecDeque<Value>,
    disposed: bool,
}

/// A named mailbox the workflow can await.
pub struct Hook {
    state: SharedState,
    correlation: CorrelationId,
    token: String,
    buffer: Rc<RefCell<HookBuffer>>,
}

impl Hook {
    /// The externally-visible token payloads are delivered to.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The hook's correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation
    }

    /// Awaits the next payload. Resolves `None` once the hook is disposed.
    pub fn next(&self) -> HookNextFuture {
        HookNextFuture {
            buffer: Rc::clone(&self.buffer),
        }
    }

    /// Disposes the hook. Recorded durably at the next handler boundary; the
    /// runtime never disposes implicitly, whatever the payloads contained.
    pub fn dispose(&self) {
        let mut st = self.state.borrow_mut();
        if let Some(item) = st.core.pending.remove(&self.correlation) {
            // A hook that never became durable has nothing to dispose.
            if item.has_created_event() {
                st.core.disposals.push(self.correlation);
            }
        }
        self.buffer.borrow_mut().disposed = true;
    }
}

/// Future for [`Hook::next`].
pub struct HookNextFuture {
    buffer: Rc<RefCell<HookBuffer>>,
}

impl Future for HookNextFuture {
    type Output = Option<Value>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut buffer = self.buffer.borrow_mut();
        if let Some(payload) = buffer.received.pop_front() {
            return Poll::Ready(Some(payload));
        }
        if buffer.disposed {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

fn step_subscription(
    correlation: CorrelationId,
    slot: StepSlot,
) -> Box<dyn FnMut(&Event, &mut EngineCore) -> Verdict> {
    Box::new(move |event, core| {
        if event.correlation_id != Some(correlation) {
            return Verdict::NotConsumed;
        }
        match event.event_type {
            EventType::StepCreated => {
                if let Some(work) = core.pending.get_mut(&correlation) {
                    work.mark_created();
                }
                Verdict::Consumed
            }
            // Execution in progress; queue idempotency protects against
            // double execution, nothing to replay here.
            EventType::StepStarted | EventType::StepRetrying => Verdict::Consumed,
            EventType::StepCompleted => {
                let decoded = match event.event_data.as_deref() {
                    Some(bytes) => payloads::decode_step_result(bytes, core.spec_version),
                    None => Ok(Value::Null),
                };
                match decoded {
                    Ok(value) => {
                        *slot.borrow_mut() = Some(Ok(value));
                        core.pending.remove(&correlation);
                        Verdict::Finished
                    }
                    Err(e) => {
                        core.corruption = Some(EngineError::Codec(e));
                        Verdict::Finished
                    }
                }
            }
            EventType::StepFailed => {
                let error = match event.event_data.as_deref() {
                    Some(bytes) => payloads::decode_step_failure(bytes, core.spec_version)
                        .unwrap_or_else(|_| WorkflowError::new("step failed")),
                    None => WorkflowError::new("step failed"),
                };
                *slot.borrow_mut() = Some(Err(error));
                core.pending.remove(&correlation);
                Verdict::Finished
            }
            other => {
                core.corruption = Some(EngineError::UnexpectedEvent {
                    correlation_id: correlation,
                    event_type: other,
                });
                Verdict::Consumed
            }
        }
    })
}

fn wait_subscription(
    correlation: CorrelationId,
    slot: Rc<RefCell<bool>>,
) -> Box<dyn FnMut(&Event, &mut EngineCore) -> Verdict> {
    Box::new(move |event, core| {
        if event.correlation_id != Some(correlation) {
            return Verdict::NotConsumed;
        }
        match event.event_type {
            EventType::WaitCreated => {
                // The recorded wake time is authoritative over the one
                // recomputed during this pass.
                if let Some(bytes) = event.event_data.as_deref() {
                    if let Ok(resume_at) = payloads::decode_wait_created(bytes, core.spec_version)
                    {
                        if let Some(PendingWork::Wait(wait)) =
                            core.pending.get_mut(&correlation)
                        {
                            wait.resume_at = resume_at;
                        }
                    }
                }
                if let Some(work) = core.pending.get_mut(&correlation) {
                    work.mark_created();
                }
                Verdict::Consumed
            }
            EventType::WaitCompleted => {
                *slot.borrow_mut() = true;
                core.pending.remove(&correlation);
                Verdict::Finished
            }
            other => {
                core.corruption = Some(EngineError::UnexpectedEvent {
                    correlation_id: correlation,
                    event_type: other,
                });
                Verdict::Consumed
            }
        }
    })
}

fn hook_subscription(
    correlation: CorrelationId,
    buffer: Rc<RefCell<HookBuffer>>,
) -> Box<dyn FnMut(&Event, &mut EngineCore) -> Verdict> {
    Box::new(move |event, core| {
        if event.correlation_id != Some(correlation) {
            return Verdict::NotConsumed;
        }
        match event.event_type {
            EventType::HookCreated => {
                if let Some(work) = core.pending.get_mut(&correlation) {
                    work.mark_created();
                }
                Verdict::Consumed
            }
            EventType::HookReceived => {
                let decoded = match event.event_data.as_deref() {
                    Some(bytes) => payloads::decode_hook_payload(bytes, core.spec_version),
                    None => Ok(Value::Null),
                };
                match decoded {
                    Ok(payload) => {
                        buffer.borrow_mut().received.push_back(payload);
                        Verdict::Consumed
                    }
                    Err(e) => {
                        core.corruption = Some(EngineError::Codec(e));
                        Verdict::Consumed
                    }
                }
            }
            EventType::HookDisposed => {
                buffer.borrow_mut().disposed = true;
                core.pending.remove(&correlation);
                Verdict::Finished
            }
            other => {
                core.corruption = Some(EngineError::UnexpectedEvent {
                    correlation_id: correlation,
                    event_type: other,
                });
                Verdict::Consumed
            }
        }
    })
}
