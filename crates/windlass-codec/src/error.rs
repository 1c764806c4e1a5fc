//! Serialization errors.
//!
//! Every failure names the operation that was being serialized ("workflow
//! arguments", "step return value", ...) and the path to the offending value.
//! The failing value itself is never encoded into the error; callers log it
//! separately.

/// Types the `devl` encoding supports, listed in error messages.
pub const SUPPORTED_TYPES: &str = "null, bool, number, bigint, string, bytes, \
     date, regexp, url, search params, error, array, object, map, set, \
     request, response, stream handle, step reference, class, class instance, \
     shared cell";

/// Error raised on any serialization boundary.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A value (or one of its children) has no encoding.
    #[error(
        "cannot serialize {operation}: unsupported value at {path}: {reason} \
         (supported types: {SUPPORTED_TYPES})"
    )]
    Unsupported {
        operation: String,
        path: String,
        reason: String,
    },

    /// Step-function references are meaningless outside a run.
    #[error(
        "cannot serialize {operation}: step functions cannot cross the \
         {boundary} boundary (at {path})"
    )]
    StepReferenceNotAllowed {
        operation: String,
        boundary: &'static str,
        path: String,
    },

    /// The payload does not start with a known 4-byte format tag.
    #[error("unknown payload format tag {tag:?} for {operation}")]
    UnknownFormatTag { operation: String, tag: String },

    /// The payload is shorter than the format tag.
    #[error("payload for {operation} is truncated ({len} bytes)")]
    TruncatedPayload { operation: String, len: usize },

    /// The payload decoded but its structure is not a valid document.
    #[error("malformed payload for {operation} at {path}: {reason}")]
    Malformed {
        operation: String,
        path: String,
        reason: String,
    },

    /// A class instance referenced a class id with no registration.
    #[error(
        "class {class_id} is not registered; register it before deserializing \
         instances of it"
    )]
    UnregisteredClass { class_id: String },

    /// A registered class rejected its payload.
    #[error("class {class_id} failed to {direction} an instance: {reason}")]
    ClassCodec {
        class_id: String,
        direction: &'static str,
        reason: String,
    },

    /// A stream frame declared a length above the hard cap.
    #[error("stream frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u64 },

    /// JSON-level failure inside the `devl` document.
    #[error("payload text is not valid: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport failure while framing (required by the codec adapters).
    #[error("stream transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload bytes are not UTF-8.
    #[error("payload text is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl CodecError {
    /// Shorthand for [`CodecError::Unsupported`].
    pub fn unsupported(
        operation: &str,
        path: &[String],
        reason: impl Into<String>,
    ) -> Self {
        Self::Unsupported {
            operation: operation.to_string(),
            path: join_path(path),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`CodecError::Malformed`].
    pub fn malformed(operation: &str, path: &[String], reason: impl Into<String>) -> Self {
        Self::Malformed {
            operation: operation.to_string(),
            path: join_path(path),
            reason: reason.into(),
        }
    }
}

pub(crate) fn join_path(path: &[String]) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        format!("$.{}", path.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_names_operation_and_path() {
        let err = CodecError::unsupported(
            "workflow arguments",
            &["orders".to_string(), "3".to_string()],
            "function values are not serializable",
        );
        let message = err.to_string();
        assert!(message.contains("workflow arguments"));
        assert!(message.contains("$.orders.3"));
        assert!(message.contains("supported types"));
    }

    #[test]
    fn empty_path_renders_root() {
        let err = CodecError::malformed("run output", &[], "not an object");
        assert!(err.to_string().contains("at $:"));
    }
}
