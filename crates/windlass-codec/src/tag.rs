//! Format-prefixed payloads.
//!
//! Serialized payloads are `[4-byte ASCII tag][payload]`. The only tag this
//! runtime writes is `devl`, a UTF-8 text encoding of a rich value. Runs with
//! `spec_version = 1` predate the prefix and carry the bare text.

use crate::error::CodecError;

/// Length of the format tag.
pub const FORMAT_TAG_LEN: usize = 4;

/// Tag for the `devl` structured text encoding.
pub const DEVL_TAG: [u8; 4] = *b"devl";

/// Prepends the `devl` tag to a payload body.
#[must_use]
pub fn prefix_devl(body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(FORMAT_TAG_LEN + body.len());
    out.extend_from_slice(&DEVL_TAG);
    out.extend_from_slice(&body);
    out
}

/// Splits a format-prefixed payload into tag and body.
pub fn split(operation: &str, bytes: &[u8]) -> Result<([u8; 4], Vec<u8>), CodecError> {
    if bytes.len() < FORMAT_TAG_LEN {
        return Err(CodecError::TruncatedPayload {
            operation: operation.to_string(),
            len: bytes.len(),
        });
    }
    let mut tag = [0u8; 4];
    tag.copy_from_slice(&bytes[..FORMAT_TAG_LEN]);
    Ok((tag, bytes[FORMAT_TAG_LEN..].to_vec()))
}

/// Strips the `devl` tag, honoring the run's payload spec version: version 1
/// payloads have no prefix, later versions require one.
pub fn strip_devl(operation: &str, bytes: &[u8], spec_version: u32) -> Result<Vec<u8>, CodecError> {
    if spec_version < 2 {
        return Ok(bytes.to_vec());
    }
    let (tag, body) = split(operation, bytes)?;
    if tag != DEVL_TAG {
        return Err(CodecError::UnknownFormatTag {
            operation: operation.to_string(),
            tag: String::from_utf8_lossy(&tag).into_owned(),
        });
    }
    Ok(body)
}
