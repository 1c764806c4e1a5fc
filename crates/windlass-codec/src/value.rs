//! The rich value model crossing engine, step, and client boundaries.
//!
//! [`Value`] covers everything the `devl` encoding can persist: JSON-shaped
//! data, binary leaves, dates, regexes, URLs, maps/sets, structural HTTP
//! requests/responses, stream handles, step-function references, registered
//! class instances, and shared cells. Shared cells ([`SharedValue`]) are how
//! user payloads express aliasing and cycles; the encoder persists each cell
//! once in a node table and emits references to it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use windlass_core::{ClassName, StepName, StreamId};

/// Structural error value (`{name, message, stack}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// What a stream carries: raw bytes, or framed serialized values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Bytes,
    Values,
}

/// Name-only handle to a stream in the stream store.
///
/// Only the handle crosses boundaries; the bytes live in the store and are
/// piped by whichever side owns the live end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle {
    pub name: StreamId,
    pub kind: StreamKind,
}

impl StreamHandle {
    pub fn bytes(name: StreamId) -> Self {
        Self {
            name,
            kind: StreamKind::Bytes,
        }
    }

    pub fn values(name: StreamId) -> Self {
        Self {
            name,
            kind: StreamKind::Values,
        }
    }
}

/// A reference to a step by stable id, optionally carrying captured closure
/// variables. Invocable on the workflow and step sides; refused at the client
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReference {
    pub step_id: StepName,
    pub closure_vars: Option<Box<Value>>,
}

impl StepReference {
    pub fn new(step_id: StepName) -> Self {
        Self {
            step_id,
            closure_vars: None,
        }
    }

    pub fn with_closure_vars(mut self, vars: Value) -> Self {
        self.closure_vars = Some(Box::new(vars));
        self
    }
}

/// Structural HTTP request (the init-options split of a request value).
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Box<Value>>,
}

/// Structural HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Box<Value>>,
}

/// A mutable cell holding a value that may be referenced from several places
/// in one payload, including from inside itself (cycles).
///
/// Equality is identity: two cells are equal only if they are the same cell.
#[derive(Clone)]
pub struct SharedValue(Arc<RwLock<Value>>);

impl SharedValue {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    /// Snapshot of the current contents. Shallow for nested shared cells.
    pub fn get(&self) -> Value {
        self.0.read().clone()
    }

    /// Replace the contents.
    pub fn set(&self, value: Value) {
        *self.0.write() = value;
    }

    /// Identity pointer, used by the encoder's visited map.
    pub(crate) fn as_ptr(&self) -> *const RwLock<Value> {
        Arc::as_ptr(&self.0)
    }

    /// Whether two handles refer to the same cell.
    pub fn ptr_eq(a: &SharedValue, b: &SharedValue) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl std::fmt::Debug for SharedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Contents may be cyclic; print the identity only.
        write!(f, "SharedValue({:p})", self.as_ptr())
    }
}

impl PartialEq for SharedValue {
    fn eq(&self, other: &Self) -> bool {
        SharedValue::ptr_eq(self, other)
    }
}

/// A value that can cross a serialization boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    /// Binary data (typed arrays, array buffers).
    Bytes(Vec<u8>),
    Date(DateTime<Utc>),
    Regexp {
        source: String,
        flags: String,
    },
    Url(url::Url),
    /// URL search params as their query-string form.
    SearchParams(String),
    Error(ErrorValue),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    /// Ordered map entries; keys may be arbitrary values.
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Request(HttpRequest),
    Response(HttpResponse),
    Stream(StreamHandle),
    StepRef(StepReference),
    /// A registered class constructor, serializable by class id alone.
    Class(ClassName),
    /// An instance of a registered class and its user-produced data.
    Instance {
        class_id: ClassName,
        data: Box<Value>,
    },
    Shared(SharedValue),
}

impl Value {
    /// Builds an object value from key/value pairs.
    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Builds an array value.
    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Self::Array(items.into_iter().collect())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::BigInt(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            Self::BigInt(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Member lookup on object values.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Object(entries) => entries.get(key),
            _ => None,
        }
    }

    /// Converts plain JSON into a value. Lossless for the JSON subset.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::Array(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(entries) => Self::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts back to plain JSON. `None` when the value (or a child) uses a
    /// non-JSON variant; follows shared cells one level deep.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Self::Null => Some(serde_json::Value::Null),
            Self::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Self::Number(n) => serde_json::Number::from_f64(*n).map(serde_json::Value::Number),
            Self::String(s) => Some(serde_json::Value::String(s.clone())),
            Self::Array(items) => items
                .iter()
                .map(Self::to_json)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Self::Object(entries) => entries
                .iter()
                .map(|(k, v)| v.to_json().map(|v| (k.clone(), v)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(serde_json::Value::Object),
            Self::Shared(cell) => cell.get().to_json(),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Self::from_json(&json)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}
