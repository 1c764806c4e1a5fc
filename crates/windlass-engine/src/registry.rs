//! Workflow and step registries.
//!
//! The build pipeline compiles user code into a bundle whose exports are
//! registered here at startup under their stable names; the registries are
//! the interface the handlers consume. Lookup happens on every delivery, so
//! the maps are immutable once the runtime is attached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, LocalBoxFuture};
use futures::FutureExt;

use windlass_codec::Value;
use windlass_core::{Manifest, RetryPolicy, RunId, StepError, StepName, WorkflowError, WorkflowName};

use crate::context::WorkflowContext;

/// A registered workflow function.
pub type WorkflowFn = Arc<
    dyn Fn(WorkflowContext, Value) -> LocalBoxFuture<'static, Result<Value, WorkflowError>>
        + Send
        + Sync,
>;

/// A registered step body.
pub type StepFn =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;

/// Context handed to a step body.
///
/// Closure variables (if the invocation carried any) are also established in
/// a task-local scope around the body, see
/// [`current_closure_vars`](windlass_codec::current_closure_vars).
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Run that owns this invocation.
    pub run_id: RunId,

    /// Step being executed.
    pub step_name: StepName,

    /// Current attempt, 1-based.
    pub attempt: u32,

    /// Attempt ceiling from the step's retry policy.
    pub max_attempts: u32,

    /// Hydrated arguments.
    pub args: Vec<Value>,

    /// Receiver, when the step was invoked as a method.
    pub this_val: Option<Value>,

    /// Captured closure variables, when the invocation carried any.
    pub closure_vars: Option<Value>,
}

impl StepContext {
    /// Argument at `index`, or `Null` when absent.
    #[must_use]
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or(Value::Null)
    }
}

/// A step body plus its execution policy.
#[derive(Clone)]
pub struct StepRegistration {
    pub body: StepFn,
    pub retry: RetryPolicy,
}

/// Registered workflows and steps.
#[derive(Default)]
pub struct Registry {
    workflows: HashMap<WorkflowName, WorkflowFn>,
    steps: HashMap<StepName, StepRegistration>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a workflow function under its stable name.
    pub fn workflow<F, Fut>(&mut self, name: WorkflowName, workflow: F)
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + 'static,
    {
        self.workflows.insert(
            name,
            Arc::new(move |ctx, input| workflow(ctx, input).boxed_local()),
        );
    }

    /// Registers a step body with the default retry policy.
    pub fn step<F, Fut>(&mut self, name: StepName, body: F)
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        self.step_with_retry(name, RetryPolicy::default(), body);
    }

    /// Registers a step body with an explicit retry policy.
    pub fn step_with_retry<F, Fut>(&mut self, name: StepName, retry: RetryPolicy, body: F)
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        self.steps.insert(
            name,
            StepRegistration {
                body: Arc::new(move |ctx| body(ctx).boxed()),
                retry,
            },
        );
    }

    #[must_use]
    pub fn get_workflow(&self, name: &WorkflowName) -> Option<&WorkflowFn> {
        self.workflows.get(name)
    }

    #[must_use]
    pub fn get_step(&self, name: &StepName) -> Option<&StepRegistration> {
        self.steps.get(name)
    }

    #[must_use]
    pub fn workflow_names(&self) -> Vec<&WorkflowName> {
        self.workflows.keys().collect()
    }

    /// Builds the static manifest of everything registered.
    #[must_use]
    pub fn manifest(&self) -> Manifest {
        let mut manifest = Manifest::new();
        for name in self.workflows.keys() {
            manifest.insert_workflow(name);
        }
        for name in self.steps.keys() {
            manifest.insert_step(name);
        }
        manifest
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut registry = Registry::new();
        let wf = WorkflowName::new("./flows.ts", "addTen");
        let step = StepName::new("./math.ts", "add");

        registry.workflow(wf.clone(), |_ctx, input| async move { Ok(input) });
        registry.step(step.clone(), |ctx| async move { Ok(ctx.arg(0)) });

        assert!(registry.get_workflow(&wf).is_some());
        assert!(registry.get_step(&step).is_some());
        assert!(registry
            .get_workflow(&WorkflowName::new("./flows.ts", "missing"))
            .is_none());
    }

    #[test]
    fn manifest_covers_registrations() {
        let mut registry = Registry::new();
        let wf = WorkflowName::new("./flows.ts", "addTen");
        let step = StepName::new("./math.ts", "add");
        registry.workflow(wf.clone(), |_ctx, input| async move { Ok(input) });
        registry.step(step.clone(), |ctx| async move { Ok(ctx.arg(0)) });

        let manifest = registry.manifest();
        assert!(manifest.workflow(&wf).is_some());
        assert!(manifest.step(&step).is_some());
    }

    #[test]
    fn step_retry_policy_is_kept() {
        let mut registry = Registry::new();
        let step = StepName::new("./math.ts", "flaky");
        registry.step_with_retry(
            step.clone(),
            RetryPolicy::fixed(std::time::Duration::from_millis(10), 7),
            |ctx| async move { Ok(ctx.arg(0)) },
        );

        let registration = registry.get_step(&step).expect("registered");
        assert_eq!(registration.retry.max_attempts, 7);
    }
}
