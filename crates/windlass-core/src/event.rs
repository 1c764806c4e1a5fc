//! Event records and per-family state machines.
//!
//! Events form the append-only log for a run. They are immutable once
//! written; replay reconstructs all workflow state by consuming them in
//! append order. Event types partition into families (run / step / hook /
//! wait) and each correlation id's subsequence must follow its family's legal
//! state-machine path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{CorrelationId, EventId, PrimitiveFamily, RunId};

/// Families an event type can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFamily {
    Run,
    Step,
    Hook,
    Wait,
}

/// All event types in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle
    RunCreated,
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCancelled,

    // Step lifecycle; correlation id `step_<ulid>`
    StepCreated,
    StepStarted,
    StepRetrying,
    StepCompleted,
    StepFailed,

    // Hook lifecycle; correlation id `hook_<ulid>`
    HookCreated,
    HookReceived,
    HookDisposed,

    // Wait lifecycle; correlation id `wait_<ulid>`
    WaitCreated,
    WaitCompleted,
}

impl EventType {
    /// The family this event type belongs to.
    #[must_use]
    pub fn family(&self) -> EventFamily {
        match self {
            Self::RunCreated
            | Self::RunStarted
            | Self::RunCompleted
            | Self::RunFailed
            | Self::RunCancelled => EventFamily::Run,
            Self::StepCreated
            | Self::StepStarted
            | Self::StepRetrying
            | Self::StepCompleted
            | Self::StepFailed => EventFamily::Step,
            Self::HookCreated | Self::HookReceived | Self::HookDisposed => EventFamily::Hook,
            Self::WaitCreated | Self::WaitCompleted => EventFamily::Wait,
        }
    }

    /// Whether this is a terminal run event; once one is appended, no further
    /// events are accepted for the run.
    #[must_use]
    pub fn is_terminal_run_event(&self) -> bool {
        matches!(self, Self::RunCompleted | Self::RunFailed | Self::RunCancelled)
    }

    /// Whether this event opens a correlation (`*_created`).
    #[must_use]
    pub fn is_correlation_created(&self) -> bool {
        matches!(self, Self::StepCreated | Self::HookCreated | Self::WaitCreated)
    }

    /// Whether this event closes a correlation.
    #[must_use]
    pub fn is_correlation_terminal(&self) -> bool {
        matches!(
            self,
            Self::StepCompleted | Self::StepFailed | Self::HookDisposed | Self::WaitCompleted
        )
    }

    /// Whether `self` may legally follow `prev` within one correlation's
    /// event subsequence. `prev = None` means `self` would be the first event
    /// for the correlation.
    #[must_use]
    pub fn may_follow(&self, prev: Option<EventType>) -> bool {
        use EventType::*;
        match prev {
            None => self.is_correlation_created(),
            Some(prev) => match (prev, self) {
                (StepCreated, StepStarted) => true,
                // A crashed attempt redelivers without an intervening
                // step_retrying; the repeated start is the at-least-once case.
                (StepStarted, StepStarted) => true,
                (StepStarted, StepRetrying) => true,
                (StepRetrying, StepStarted) => true,
                (StepStarted, StepCompleted) => true,
                (StepStarted, StepFailed) => true,
                (HookCreated, HookReceived) => true,
                (HookReceived, HookReceived) => true,
                (HookCreated, HookDisposed) => true,
                (HookReceived, HookDisposed) => true,
                (WaitCreated, WaitCompleted) => true,
                _ => false,
            },
        }
    }

    /// The primitive family matching this event type's correlation prefix,
    /// if the type is correlated at all.
    #[must_use]
    pub fn primitive_family(&self) -> Option<PrimitiveFamily> {
        match self.family() {
            EventFamily::Run => None,
            EventFamily::Step => Some(PrimitiveFamily::Step),
            EventFamily::Hook => Some(PrimitiveFamily::Hook),
            EventFamily::Wait => Some(PrimitiveFamily::Wait),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde snake_case names so logs match the wire format.
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// A persisted event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (`evt_<ulid>`); sorts in append order.
    pub event_id: EventId,

    /// Run this event belongs to.
    pub run_id: RunId,

    /// Event type.
    pub event_type: EventType,

    /// Correlation id for step/hook/wait events; absent for run-level events.
    pub correlation_id: Option<CorrelationId>,

    /// Append time.
    pub created_at: DateTime<Utc>,

    /// Payload format version.
    pub spec_version: u32,

    /// Serialized payload bytes (format-prefixed), if any.
    #[serde(default, with = "crate::serde_bytes::option")]
    pub event_data: Option<Vec<u8>>,
}

/// The caller-supplied part of an event; the event log fills in id, run id,
/// timestamp, and spec version at append time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub correlation_id: Option<CorrelationId>,
    pub event_data: Option<Vec<u8>>,
}

impl NewEvent {
    /// Create an event with no correlation and no payload.
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            correlation_id: None,
            event_data: None,
        }
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.event_data = Some(data);
        self
    }
}
