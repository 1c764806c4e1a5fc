//! # Windlass public API
//!
//! Client-facing entry points to launch a run and observe its state, output,
//! and streams, plus the HTTP endpoints the host registers under
//! `/.well-known/workflow/v1/`.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use windlass_api::Client;
//! use windlass_codec::Value;
//! use windlass_core::WorkflowName;
//! use windlass_engine::Runtime;
//! use windlass_world::{InMemoryQueue, InMemoryWorld};
//!
//! let mut runtime = Runtime::new(Arc::new(InMemoryWorld::new()), Arc::new(InMemoryQueue::new()));
//! // ... register workflows and steps ...
//! let runtime = Arc::new(runtime);
//! Runtime::attach(&runtime).await?;
//!
//! let client = Client::new(runtime);
//! let run = client
//!     .start(&WorkflowName::new("./flows.ts", "addTen"), Value::from(123.0))
//!     .await?;
//! let output = run.return_value(std::time::Duration::from_secs(30)).await?;
//! ```

pub mod client;
pub mod routes;
pub mod streams;

pub use client::{Client, ClientError, RunHandle};
pub use routes::{routes as host_routes, AppState};
pub use streams::{ByteStreamReader, StreamReadError, ValueStreamReader, ValueStreamWriter};
