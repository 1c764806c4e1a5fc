//! # Windlass replay engine and runtime
//!
//! The deterministic orchestrator at the heart of the durable workflow
//! runtime. Workflow code runs against an append-only event log: every
//! durable primitive ([`WorkflowContext::step`], [`WorkflowContext::sleep`],
//! [`WorkflowContext::hook`], [`WorkflowContext::spawn`]) resolves from the
//! log or suspends the run until the queue redelivers it. Nothing in memory
//! is authoritative; a run survives crashes, cold starts, and redeployments
//! because replay rebuilds all state from its events.
//!
//! Layers:
//!
//! - [`engine::replay`] — the pure replay pass ([`ReplayOutcome`])
//! - [`Runtime`] — queue handlers, `start`, cancel, and hook delivery
//! - [`Registry`] — workflow and step registration
//! - [`remap::StackRemapper`] — source-mapped error stacks
//! - [`StreamWriter`] — buffered writes into the stream store

pub mod clock;
pub mod consumer;
pub mod context;
pub mod engine;
mod handlers;
pub mod health;
pub mod messages;
pub mod payloads;
pub mod pending;
pub mod registry;
pub mod remap;
pub mod runtime;
mod state;
pub mod streamio;

pub use clock::WallClock;
pub use consumer::{EventsConsumer, Verdict};
pub use context::{Hook, HookOptions, StepOptions, WorkflowContext};
pub use engine::{replay, EngineError, ReplayOutcome, ReplayReport};
pub use messages::{StepMessage, WorkflowMessage};
pub use pending::{PendingCounts, PendingQueue, PendingWork};
pub use registry::{Registry, StepContext, StepFn, StepRegistration, WorkflowFn};
pub use remap::StackRemapper;
pub use runtime::{spawn_step_name, Runtime, RuntimeConfig, RuntimeError};
pub use streamio::StreamWriter;
