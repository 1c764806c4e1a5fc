//! Hydration: `devl` payload bytes back to rich values.
//!
//! Mirrors the encoder: `$`-tagged single-key objects are special types,
//! anything else is plain data. The `shared` node table is materialized as
//! [`SharedValue`] cells first, then filled, so `$ref` entries — including
//! self-references — resolve to live cells and cyclic graphs reconstruct.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};

use crate::boundary::Boundary;
use crate::error::CodecError;
use crate::registry;
use crate::tag;
use crate::value::{
    ErrorValue, HttpRequest, HttpResponse, SharedValue, StepReference, StreamHandle, StreamKind,
    Value,
};

/// Deserializes a format-prefixed payload produced by
/// [`dehydrate`](crate::encode::dehydrate). Assumes the current payload spec
/// version; use [`hydrate_versioned`] for data at rest.
pub fn hydrate(bytes: &[u8], boundary: Boundary, operation: &str) -> Result<Value, CodecError> {
    hydrate_versioned(bytes, windlass_core::CURRENT_SPEC_VERSION, boundary, operation)
}

/// Deserializes a payload written under the given run spec version
/// (version 1 payloads carry no format tag).
pub fn hydrate_versioned(
    bytes: &[u8],
    spec_version: u32,
    boundary: Boundary,
    operation: &str,
) -> Result<Value, CodecError> {
    let body = tag::strip_devl(operation, bytes, spec_version)?;
    let doc: serde_json::Value = serde_json::from_slice(&body)?;

    let shared_nodes = match doc.get("shared") {
        Some(serde_json::Value::Array(nodes)) => nodes.as_slice(),
        Some(_) => {
            return Err(CodecError::malformed(
                operation,
                &[],
                "\"shared\" must be an array",
            ))
        }
        None => &[],
    };
    let root = doc.get("root").ok_or_else(|| {
        CodecError::malformed(operation, &[], "document has no \"root\" node")
    })?;

    let mut decoder = Decoder {
        boundary,
        operation,
        path: Vec::new(),
        cells: (0..shared_nodes.len())
            .map(|_| SharedValue::new(Value::Null))
            .collect(),
    };

    // Fill cells after they all exist so forward and cyclic refs resolve.
    for (i, node) in shared_nodes.iter().enumerate() {
        decoder.path.push(format!("<shared:{i}>"));
        let value = decoder.decode(node)?;
        decoder.path.pop();
        decoder.cells[i].set(value);
    }

    decoder.decode(root)
}

struct Decoder<'a> {
    boundary: Boundary,
    operation: &'a str,
    path: Vec<String>,
    cells: Vec<SharedValue>,
}

impl Decoder<'_> {
    fn decode(&mut self, node: &serde_json::Value) -> Result<Value, CodecError> {
        match node {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => Ok(Value::Number(n.as_f64().ok_or_else(|| {
                self.malformed("number is outside the f64 range")
            })?)),
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    self.path.push(i.to_string());
                    out.push(self.decode(item)?);
                    self.path.pop();
                }
                Ok(Value::Array(out))
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    let (key, inner) = map.iter().next().expect("len checked");
                    if let Some(tag_name) = key.strip_prefix('$') {
                        return self.decode_tagged(tag_name, inner);
                    }
                }
                let mut out = indexmap::IndexMap::with_capacity(map.len());
                for (key, item) in map {
                    self.path.push(key.clone());
                    out.insert(key.clone(), self.decode(item)?);
                    self.path.pop();
                }
                Ok(Value::Object(out))
            }
        }
    }

    fn decode_tagged(
        &mut self,
        tag_name: &str,
        inner: &serde_json::Value,
    ) -> Result<Value, CodecError> {
        match tag_name {
            "object" => {
                let map = self.expect_object(inner)?;
                let mut out = indexmap::IndexMap::with_capacity(map.len());
                for (key, item) in map {
                    self.path.push(key.clone());
                    out.insert(key.clone(), self.decode(item)?);
                    self.path.pop();
                }
                Ok(Value::Object(out))
            }
            "number" => match self.expect_str(inner)? {
                "nan" => Ok(Value::Number(f64::NAN)),
                "inf" => Ok(Value::Number(f64::INFINITY)),
                "-inf" => Ok(Value::Number(f64::NEG_INFINITY)),
                other => Err(self.malformed(format!("unknown $number form {other:?}"))),
            },
            "bigint" => {
                let digits = self.expect_str(inner)?;
                digits
                    .parse::<i128>()
                    .map(Value::BigInt)
                    .map_err(|e| self.malformed(format!("bad bigint {digits:?}: {e}")))
            }
            "bytes" => {
                let encoded = self.expect_str(inner)?;
                if encoded == crate::encode::EMPTY_SENTINEL {
                    return Ok(Value::Bytes(vec![]));
                }
                BASE64
                    .decode(encoded.as_bytes())
                    .map(Value::Bytes)
                    .map_err(|e| self.malformed(format!("bad base64: {e}")))
            }
            "date" => {
                let text = self.expect_str(inner)?;
                if text == crate::encode::EMPTY_SENTINEL {
                    // Invalid-date sentinel; collapse to the epoch.
                    return Ok(Value::Date(DateTime::<Utc>::UNIX_EPOCH));
                }
                DateTime::parse_from_rfc3339(text)
                    .map(|at| Value::Date(at.with_timezone(&Utc)))
                    .map_err(|e| self.malformed(format!("bad date {text:?}: {e}")))
            }
            "regexp" => {
                let source = self.expect_field_str(inner, "source")?;
                let flags = self.expect_field_str(inner, "flags")?;
                Ok(Value::Regexp { source, flags })
            }
            "url" => {
                let text = self.expect_str(inner)?;
                url::Url::parse(text)
                    .map(Value::Url)
                    .map_err(|e| self.malformed(format!("bad url {text:?}: {e}")))
            }
            "params" => {
                let text = self.expect_str(inner)?;
                if text == crate::encode::EMPTY_SENTINEL {
                    Ok(Value::SearchParams(String::new()))
                } else {
                    Ok(Value::SearchParams(text.to_string()))
                }
            }
            "error" => {
                let name = self.expect_field_str(inner, "name")?;
                let message = self.expect_field_str(inner, "message")?;
                let stack = match inner.get("stack") {
                    Some(serde_json::Value::String(s)) => Some(s.clone()),
                    _ => None,
                };
                Ok(Value::Error(ErrorValue {
                    name,
                    message,
                    stack,
                }))
            }
            "map" => {
                let entries = self.expect_array(inner)?;
                let mut out = Vec::with_capacity(entries.len());
                for (i, entry) in entries.iter().enumerate() {
                    self.path.push(format!("<map:{i}>"));
                    let pair = self.expect_array(entry)?;
                    if pair.len() != 2 {
                        return Err(self.malformed("map entry must be a [key, value] pair"));
                    }
                    let key = self.decode(&pair[0])?;
                    let value = self.decode(&pair[1])?;
                    self.path.pop();
                    out.push((key, value));
                }
                Ok(Value::Map(out))
            }
            "set" => {
                let items = self.expect_array(inner)?;
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    self.path.push(format!("<set:{i}>"));
                    out.push(self.decode(item)?);
                    self.path.pop();
                }
                Ok(Value::Set(out))
            }
            "request" => {
                let method = self.expect_field_str(inner, "method")?;
                let url = self.expect_field_str(inner, "url")?;
                let headers = self.decode_headers(inner)?;
                let body = self.decode_body(inner)?;
                Ok(Value::Request(HttpRequest {
                    method,
                    url,
                    headers,
                    body,
                }))
            }
            "response" => {
                let status = inner
                    .get("status")
                    .and_then(serde_json::Value::as_u64)
                    .ok_or_else(|| self.malformed("response has no numeric status"))?;
                let headers = self.decode_headers(inner)?;
                let body = self.decode_body(inner)?;
                Ok(Value::Response(HttpResponse {
                    status: status as u16,
                    headers,
                    body,
                }))
            }
            "stream" => {
                let name = self.expect_field_str(inner, "name")?;
                let name = name
                    .parse()
                    .map_err(|e| self.malformed(format!("bad stream name: {e}")))?;
                let kind = match inner.get("kind").and_then(serde_json::Value::as_str) {
                    Some("bytes") | None => StreamKind::Bytes,
                    Some("values") => StreamKind::Values,
                    Some(other) => {
                        return Err(self.malformed(format!("unknown stream kind {other:?}")))
                    }
                };
                Ok(Value::Stream(StreamHandle { name, kind }))
            }
            "step" => {
                if !self.boundary.allows_step_references() {
                    return Err(CodecError::StepReferenceNotAllowed {
                        operation: self.operation.to_string(),
                        boundary: self.boundary.name(),
                        path: crate::error::join_path(&self.path),
                    });
                }
                let id = self.expect_field_str(inner, "id")?;
                let step_id = id
                    .parse()
                    .map_err(|e| self.malformed(format!("bad step id: {e}")))?;
                let closure_vars = match inner.get("closure") {
                    None | Some(serde_json::Value::Null) => None,
                    Some(node) => {
                        self.path.push("<closure>".to_string());
                        let vars = self.decode(node)?;
                        self.path.pop();
                        Some(Box::new(vars))
                    }
                };
                Ok(Value::StepRef(StepReference {
                    step_id,
                    closure_vars,
                }))
            }
            "class" => {
                let id = self.expect_str(inner)?;
                let class_id = id
                    .parse()
                    .map_err(|e| self.malformed(format!("bad class id: {e}")))?;
                Ok(Value::Class(class_id))
            }
            "instance" => {
                let class = self.expect_field_str(inner, "class")?;
                let class_id: windlass_core::ClassName = class
                    .parse()
                    .map_err(|e| self.malformed(format!("bad class id: {e}")))?;
                if !registry::is_registered(&class_id) {
                    return Err(CodecError::UnregisteredClass {
                        class_id: class_id.to_string(),
                    });
                }
                let data = inner
                    .get("data")
                    .ok_or_else(|| self.malformed("instance has no data"))?;
                self.path.push("<instance>".to_string());
                let data = self.decode(data)?;
                self.path.pop();
                Ok(Value::Instance {
                    class_id,
                    data: Box::new(data),
                })
            }
            "ref" => {
                let idx = inner
                    .as_u64()
                    .ok_or_else(|| self.malformed("$ref must be an index"))?
                    as usize;
                let cell = self
                    .cells
                    .get(idx)
                    .ok_or_else(|| self.malformed(format!("$ref {idx} out of range")))?;
                Ok(Value::Shared(cell.clone()))
            }
            other => Err(self.malformed(format!("unknown tag ${other}"))),
        }
    }

    fn decode_headers(
        &mut self,
        inner: &serde_json::Value,
    ) -> Result<Vec<(String, String)>, CodecError> {
        let Some(headers) = inner.get("headers") else {
            return Ok(vec![]);
        };
        let entries = self.expect_array(headers)?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let pair = self.expect_array(entry)?;
            if pair.len() != 2 {
                return Err(self.malformed("header entry must be a [name, value] pair"));
            }
            let name = pair[0]
                .as_str()
                .ok_or_else(|| self.malformed("header name must be a string"))?;
            let value = pair[1]
                .as_str()
                .ok_or_else(|| self.malformed("header value must be a string"))?;
            out.push((name.to_string(), value.to_string()));
        }
        Ok(out)
    }

    fn decode_body(&mut self, inner: &serde_json::Value) -> Result<Option<Box<Value>>, CodecError> {
        match inner.get("body") {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(node) => {
                self.path.push("<body>".to_string());
                let body = self.decode(node)?;
                self.path.pop();
                Ok(Some(Box::new(body)))
            }
        }
    }

    fn expect_str<'n>(&self, node: &'n serde_json::Value) -> Result<&'n str, CodecError> {
        node.as_str()
            .ok_or_else(|| self.malformed("expected a string"))
    }

    fn expect_field_str(
        &self,
        node: &serde_json::Value,
        field: &str,
    ) -> Result<String, CodecError> {
        node.get(field)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| self.malformed(format!("missing string field {field:?}")))
    }

    fn expect_array<'n>(
        &self,
        node: &'n serde_json::Value,
    ) -> Result<&'n Vec<serde_json::Value>, CodecError> {
        node.as_array()
            .ok_or_else(|| self.malformed("expected an array"))
    }

    fn expect_object<'n>(
        &self,
        node: &'n serde_json::Value,
    ) -> Result<&'n serde_json::Map<String, serde_json::Value>, CodecError> {
        node.as_object()
            .ok_or_else(|| self.malformed("expected an object"))
    }

    fn malformed(&self, reason: impl Into<String>) -> CodecError {
        CodecError::malformed(self.operation, &self.path, reason)
    }
}
