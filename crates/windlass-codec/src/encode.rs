//! Dehydration: rich values to `devl` payload bytes.
//!
//! The payload body is a UTF-8 JSON document `{"v": 1, "shared": [...],
//! "root": <node>}`. Special types encode as single-key `$`-tagged objects;
//! plain objects that would collide with a tag are wrapped in `$object`.
//! Shared cells are written once into the `shared` node table and referenced
//! with `{"$ref": index}`, which is what lets aliased and cyclic graphs
//! round-trip.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::SecondsFormat;
use serde_json::json;

use crate::boundary::Boundary;
use crate::error::CodecError;
use crate::tag;
use crate::value::{HttpRequest, HttpResponse, Value};

/// Document version inside the `devl` body.
pub(crate) const DOC_VERSION: u32 = 1;

/// Sentinel for empty binary/search-param payloads, preserving truthiness in
/// consumers that coerce the encoded field.
pub(crate) const EMPTY_SENTINEL: &str = ".";

/// Serializes a value for the given boundary, returning format-prefixed
/// bytes. `operation` names what is being serialized ("workflow arguments",
/// "step return value", ...) and appears in any error.
pub fn dehydrate(value: &Value, boundary: Boundary, operation: &str) -> Result<Vec<u8>, CodecError> {
    let mut encoder = Encoder {
        boundary,
        operation,
        path: Vec::new(),
        shared_ids: HashMap::new(),
        shared_nodes: Vec::new(),
    };

    let root = encoder.encode(value)?;
    let shared: Vec<serde_json::Value> = encoder
        .shared_nodes
        .into_iter()
        .map(|n| n.unwrap_or(serde_json::Value::Null))
        .collect();

    let doc = json!({
        "v": DOC_VERSION,
        "shared": shared,
        "root": root,
    });

    Ok(tag::prefix_devl(serde_json::to_vec(&doc)?))
}

struct Encoder<'a> {
    boundary: Boundary,
    operation: &'a str,
    path: Vec<String>,
    /// Shared-cell pointer -> index in `shared_nodes`.
    shared_ids: HashMap<usize, usize>,
    /// `None` marks a cell whose contents are still being encoded (cycle).
    shared_nodes: Vec<Option<serde_json::Value>>,
}

impl Encoder<'_> {
    fn encode(&mut self, value: &Value) -> Result<serde_json::Value, CodecError> {
        match value {
            Value::Null => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(json!(b)),
            Value::Number(n) => Ok(match serde_json::Number::from_f64(*n) {
                Some(num) => serde_json::Value::Number(num),
                // NaN and infinities have no JSON literal.
                None => json!({ "$number": format_nonfinite(*n) }),
            }),
            Value::BigInt(n) => Ok(json!({ "$bigint": n.to_string() })),
            Value::String(s) => Ok(json!(s)),
            Value::Bytes(bytes) => {
                let encoded = if bytes.is_empty() {
                    EMPTY_SENTINEL.to_string()
                } else {
                    BASE64.encode(bytes)
                };
                Ok(json!({ "$bytes": encoded }))
            }
            Value::Date(at) => Ok(json!({
                "$date": at.to_rfc3339_opts(SecondsFormat::Millis, true),
            })),
            Value::Regexp { source, flags } => Ok(json!({
                "$regexp": { "source": source, "flags": flags },
            })),
            Value::Url(url) => Ok(json!({ "$url": url.as_str() })),
            Value::SearchParams(query) => {
                let encoded = if query.is_empty() {
                    EMPTY_SENTINEL
                } else {
                    query.as_str()
                };
                Ok(json!({ "$params": encoded }))
            }
            Value::Error(error) => Ok(json!({
                "$error": {
                    "name": error.name,
                    "message": error.message,
                    "stack": error.stack,
                },
            })),
            Value::Array(items) => {
                let mut nodes = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    self.path.push(i.to_string());
                    nodes.push(self.encode(item)?);
                    self.path.pop();
                }
                Ok(serde_json::Value::Array(nodes))
            }
            Value::Object(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (key, item) in entries {
                    self.path.push(key.clone());
                    map.insert(key.clone(), self.encode(item)?);
                    self.path.pop();
                }
                // A single $-prefixed key would be read back as a tag.
                if map.len() == 1
                    && map.keys().next().is_some_and(|k| k.starts_with('$'))
                {
                    Ok(json!({ "$object": serde_json::Value::Object(map) }))
                } else {
                    Ok(serde_json::Value::Object(map))
                }
            }
            Value::Map(entries) => {
                let mut nodes = Vec::with_capacity(entries.len());
                for (i, (key, item)) in entries.iter().enumerate() {
                    self.path.push(format!("<map:{i}>"));
                    let k = self.encode(key)?;
                    let v = self.encode(item)?;
                    self.path.pop();
                    nodes.push(json!([k, v]));
                }
                Ok(json!({ "$map": nodes }))
            }
            Value::Set(items) => {
                let mut nodes = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    self.path.push(format!("<set:{i}>"));
                    nodes.push(self.encode(item)?);
                    self.path.pop();
                }
                Ok(json!({ "$set": nodes }))
            }
            Value::Request(request) => self.encode_request(request),
            Value::Response(response) => self.encode_response(response),
            Value::Stream(handle) => Ok(json!({
                "$stream": {
                    "name": handle.name.to_string(),
                    "kind": handle.kind,
                },
            })),
            Value::StepRef(step_ref) => {
                if !self.boundary.allows_step_references() {
                    return Err(CodecError::StepReferenceNotAllowed {
                        operation: self.operation.to_string(),
                        boundary: self.boundary.name(),
                        path: crate::error::join_path(&self.path),
                    });
                }
                let closure = match &step_ref.closure_vars {
                    Some(vars) => {
                        self.path.push("<closure>".to_string());
                        let node = self.encode(vars)?;
                        self.path.pop();
                        Some(node)
                    }
                    None => None,
                };
                Ok(json!({
                    "$step": {
                        "id": step_ref.step_id.to_string(),
                        "closure": closure,
                    },
                }))
            }
            Value::Class(class_id) => Ok(json!({ "$class": class_id.to_string() })),
            Value::Instance { class_id, data } => {
                self.path.push("<instance>".to_string());
                let node = self.encode(data)?;
                self.path.pop();
                Ok(json!({
                    "$instance": { "class": class_id.to_string(), "data": node },
                }))
            }
            Value::Shared(cell) => {
                let key = cell.as_ptr() as usize;
                if let Some(&idx) = self.shared_ids.get(&key) {
                    return Ok(json!({ "$ref": idx }));
                }

                let idx = self.shared_nodes.len();
                self.shared_ids.insert(key, idx);
                self.shared_nodes.push(None);

                let contents = cell.get();
                self.path.push(format!("<shared:{idx}>"));
                let node = self.encode(&contents)?;
                self.path.pop();

                self.shared_nodes[idx] = Some(node);
                Ok(json!({ "$ref": idx }))
            }
        }
    }

    fn encode_request(&mut self, request: &HttpRequest) -> Result<serde_json::Value, CodecError> {
        let body = match &request.body {
            Some(body) => {
                self.path.push("<body>".to_string());
                let node = self.encode(body)?;
                self.path.pop();
                Some(node)
            }
            None => None,
        };
        Ok(json!({
            "$request": {
                "method": request.method,
                "url": request.url,
                "headers": request.headers,
                "body": body,
            },
        }))
    }

    fn encode_response(&mut self, response: &HttpResponse) -> Result<serde_json::Value, CodecError> {
        let body = match &response.body {
            Some(body) => {
                self.path.push("<body>".to_string());
                let node = self.encode(body)?;
                self.path.pop();
                Some(node)
            }
            None => None,
        };
        Ok(json!({
            "$response": {
                "status": response.status,
                "headers": response.headers,
                "body": body,
            },
        }))
    }
}

fn format_nonfinite(n: f64) -> &'static str {
    if n.is_nan() {
        "nan"
    } else if n.is_sign_positive() {
        "inf"
    } else {
        "-inf"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SharedValue;

    fn body_json(bytes: &[u8]) -> serde_json::Value {
        assert_eq!(&bytes[..4], b"devl");
        serde_json::from_slice(&bytes[4..]).expect("valid document")
    }

    #[test]
    fn plain_data_stays_json_shaped() {
        let value = Value::object([
            ("n", Value::from(3.0)),
            ("s", Value::from("hi")),
            ("list", Value::array([Value::Null, Value::Bool(true)])),
        ]);
        let bytes = dehydrate(&value, Boundary::Workflow, "test").expect("encode");
        let doc = body_json(&bytes);
        assert_eq!(doc["root"]["n"], 3.0);
        assert_eq!(doc["root"]["s"], "hi");
        assert_eq!(doc["root"]["list"][0], serde_json::Value::Null);
    }

    #[test]
    fn empty_bytes_use_sentinel() {
        let bytes = dehydrate(&Value::Bytes(vec![]), Boundary::Workflow, "test").expect("encode");
        assert_eq!(body_json(&bytes)["root"]["$bytes"], ".");
    }

    #[test]
    fn dollar_keyed_object_is_escaped() {
        let value = Value::object([("$ref", Value::from(1.0))]);
        let bytes = dehydrate(&value, Boundary::Workflow, "test").expect("encode");
        let doc = body_json(&bytes);
        assert_eq!(doc["root"]["$object"]["$ref"], 1.0);
    }

    #[test]
    fn step_ref_refused_at_client_boundary() {
        let value = Value::StepRef(crate::value::StepReference::new(
            windlass_core::StepName::new("./math.ts", "add"),
        ));
        let err = dehydrate(&value, Boundary::Client, "workflow arguments").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("workflow arguments"));
        assert!(message.contains("client"));
    }

    #[test]
    fn shared_cell_encodes_once() {
        let cell = SharedValue::new(Value::from("common"));
        let value = Value::array([
            Value::Shared(cell.clone()),
            Value::Shared(cell.clone()),
            Value::Shared(cell),
        ]);

        let bytes = dehydrate(&value, Boundary::Workflow, "test").expect("encode");
        let doc = body_json(&bytes);
        assert_eq!(doc["shared"].as_array().expect("shared").len(), 1);
        assert_eq!(doc["root"][0]["$ref"], 0);
        assert_eq!(doc["root"][2]["$ref"], 0);
    }

    #[test]
    fn cycle_encodes_without_recursion() {
        let cell = SharedValue::new(Value::Null);
        cell.set(Value::object([("me", Value::Shared(cell.clone()))]));

        let bytes =
            dehydrate(&Value::Shared(cell), Boundary::Workflow, "test").expect("encode");
        let doc = body_json(&bytes);
        assert_eq!(doc["root"]["$ref"], 0);
        assert_eq!(doc["shared"][0]["me"]["$ref"], 0);
    }

    #[test]
    fn nonfinite_numbers_are_tagged() {
        let bytes =
            dehydrate(&Value::Number(f64::NAN), Boundary::Workflow, "test").expect("encode");
        assert_eq!(body_json(&bytes)["root"]["$number"], "nan");
    }
}
