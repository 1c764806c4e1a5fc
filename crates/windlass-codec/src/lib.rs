//! # Windlass serialization layer
//!
//! The format, type registry, and streaming protocol used to persist
//! arguments, return values, and live streams across the engine ↔ step ↔
//! client boundaries.
//!
//! - [`Value`] — the rich value graph (binary leaves, dates, regexes, maps,
//!   sets, HTTP structures, stream handles, step references, registered class
//!   instances, shared/cyclic cells)
//! - [`dehydrate`] / [`hydrate`] — the format-prefixed `devl` text encoding
//! - [`FrameDecoder`] — the framed stream chunk codec, with the legacy
//!   newline-delimited read mode
//! - [`registry`] — the process-wide class registry
//! - [`Boundary`] — which value kinds may cross where
//!
//! ## Example
//!
//! ```
//! use windlass_codec::{dehydrate, hydrate, Boundary, Value};
//!
//! let value = Value::object([("answer", Value::from(42.0))]);
//! let bytes = dehydrate(&value, Boundary::Workflow, "example").unwrap();
//! assert_eq!(&bytes[..4], b"devl");
//! assert_eq!(hydrate(&bytes, Boundary::Workflow, "example").unwrap(), value);
//! ```

pub mod boundary;
pub mod decode;
pub mod encode;
pub mod error;
pub mod frame;
pub mod registry;
pub mod stepfn;
pub mod tag;
pub mod value;

pub use boundary::Boundary;
pub use decode::{hydrate, hydrate_versioned};
pub use encode::dehydrate;
pub use error::{CodecError, SUPPORTED_TYPES};
pub use frame::{encode_frame, DecodeMode, FrameDecoder, MAX_FRAME_LEN};
pub use registry::{is_registered, register_class, DurableClass};
pub use stepfn::{current_closure_vars, with_closure_vars};
pub use tag::{DEVL_TAG, FORMAT_TAG_LEN};
pub use value::{
    ErrorValue, HttpRequest, HttpResponse, SharedValue, StepReference, StreamHandle, StreamKind,
    Value,
};
