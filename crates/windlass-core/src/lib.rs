//! # Windlass core data model
//!
//! Shared types for the durable workflow runtime:
//!
//! - **Ids** — prefixed ULIDs (`wrun_`, `step_`, `hook_`, `wait_`, `strm_`,
//!   `evt_`) and the deterministic [`IdSource`] replay factory
//! - **Events** — the append-only per-run log records and their per-family
//!   state machines
//! - **Runs** — run records whose snapshots are maintained by the event log
//! - **Names** — `workflow//module//function` encoding and queue topics
//! - **Errors & retries** — the step/workflow error taxonomy and the
//!   exponential-backoff [`RetryPolicy`]
//!
//! Nothing here performs I/O; the world and engine crates build on these
//! types.

pub mod error;
pub mod event;
pub mod id;
pub mod manifest;
pub mod name;
pub mod retry;
pub mod run;
pub mod serde_bytes;

pub use error::{StepError, WorkflowError};
pub use event::{Event, EventFamily, EventType, NewEvent};
pub use id::{CorrelationId, EventId, IdSource, ParseIdError, PrimitiveFamily, RunId, StreamId};
pub use manifest::{Manifest, StepEntry, WorkflowEntry, MANIFEST_VERSION};
pub use name::{
    ClassName, NameError, StepName, WorkflowName, STEP_TOPIC_PREFIX, WORKFLOW_TOPIC_PREFIX,
};
pub use retry::RetryPolicy;
pub use run::{Run, RunStatus, CURRENT_SPEC_VERSION};
