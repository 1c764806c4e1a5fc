//! The pending-work queue.
//!
//! During a replay pass every durable primitive user code reaches registers a
//! pending item keyed by its correlation id. Items whose terminal event is
//! consumed from the log are removed again; whatever is left when the pass
//! suspends is the work the suspension handler turns into `*_created` events
//! and queue messages.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use windlass_codec::Value;
use windlass_core::{CorrelationId, StepName, WorkflowName};

/// A step invocation awaiting durable resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStep {
    pub name: StepName,
    pub args: Vec<Value>,
    /// Receiver captured when the step was invoked as a method.
    pub this_val: Option<Value>,
    /// Captured closure variables for step-function references.
    pub closure_vars: Option<Value>,
    /// True iff a `step_created` was observed for this correlation during
    /// replay; the suspension handler then re-enqueues instead of creating.
    pub has_created_event: bool,
}

/// A hook awaiting payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingHook {
    pub token: String,
    /// Static response the host returns to webhook callers, if configured.
    pub static_response: Option<Value>,
    pub metadata: Option<Value>,
    pub has_created_event: bool,
}

/// A durable delay.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWait {
    pub resume_at: DateTime<Utc>,
    pub has_created_event: bool,
}

/// A child workflow spawn; durably recorded through the built-in spawn step,
/// so its correlation id is in the step family.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRun {
    pub workflow_name: WorkflowName,
    pub input: Value,
    pub has_created_event: bool,
}

/// One entry in the pending-work queue.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWork {
    Step(PendingStep),
    Hook(PendingHook),
    Wait(PendingWait),
    Run(PendingRun),
}

impl PendingWork {
    /// Whether the `*_created` event for this item already exists in the log.
    #[must_use]
    pub fn has_created_event(&self) -> bool {
        match self {
            Self::Step(s) => s.has_created_event,
            Self::Hook(h) => h.has_created_event,
            Self::Wait(w) => w.has_created_event,
            Self::Run(r) => r.has_created_event,
        }
    }

    pub(crate) fn mark_created(&mut self) {
        match self {
            Self::Step(s) => s.has_created_event = true,
            Self::Hook(h) => h.has_created_event = true,
            Self::Wait(w) => w.has_created_event = true,
            Self::Run(r) => r.has_created_event = true,
        }
    }
}

/// Per-family counts, reported with every suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingCounts {
    pub steps: usize,
    pub hooks: usize,
    pub waits: usize,
    pub runs: usize,
}

/// Pending items keyed by correlation id, in the deterministic order user
/// code reached them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingQueue {
    items: IndexMap<CorrelationId, PendingWork>,
}

impl PendingQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, correlation_id: CorrelationId, work: PendingWork) {
        self.items.insert(correlation_id, work);
    }

    pub fn remove(&mut self, correlation_id: &CorrelationId) -> Option<PendingWork> {
        self.items.shift_remove(correlation_id)
    }

    #[must_use]
    pub fn get(&self, correlation_id: &CorrelationId) -> Option<&PendingWork> {
        self.items.get(correlation_id)
    }

    pub fn get_mut(&mut self, correlation_id: &CorrelationId) -> Option<&mut PendingWork> {
        self.items.get_mut(correlation_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CorrelationId, &PendingWork)> {
        self.items.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Per-family counts for the suspension report.
    #[must_use]
    pub fn counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for work in self.items.values() {
            match work {
                PendingWork::Step(_) => counts.steps += 1,
                PendingWork::Hook(_) => counts.hooks += 1,
                PendingWork::Wait(_) => counts.waits += 1,
                PendingWork::Run(_) => counts.runs += 1,
            }
        }
        counts
    }

    /// Earliest wake time among pending waits, if any.
    #[must_use]
    pub fn earliest_resume_at(&self) -> Option<DateTime<Utc>> {
        self.items
            .values()
            .filter_map(|work| match work {
                PendingWork::Wait(w) => Some(w.resume_at),
                _ => None,
            })
            .min()
    }
}

impl IntoIterator for PendingQueue {
    type Item = (CorrelationId, PendingWork);
    type IntoIter = indexmap::map::IntoIter<CorrelationId, PendingWork>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
