//! # Windlass world backends
//!
//! The pluggable storage and transport substrate of the runtime:
//!
//! - [`World`] — per-run append-only event log (with atomic run snapshots),
//!   run store, append-only tail-readable streams, and the hook token index
//! - [`Queue`] — at-least-once topics, idempotent per `(topic, message_key)`,
//!   with handler-requested redelivery delays
//! - [`InMemoryWorld`] / [`InMemoryQueue`] — the reference implementations
//! - [`PostgresWorld`] — production persistence
//! - [`WorldConfig`] — `WORKFLOW_*` environment selection

pub mod config;
pub mod memory;
pub mod memory_queue;
pub mod postgres;
pub mod queue;
pub mod store;

pub use config::{VercelConfig, WorldConfig, WorldTarget};
pub use memory::InMemoryWorld;
pub use memory_queue::InMemoryQueue;
pub use postgres::PostgresWorld;
pub use queue::{Delivery, HandlerOutcome, Queue, QueueError, QueueHandler};
pub use store::{HookRegistration, RunPatch, World, WorldError};
