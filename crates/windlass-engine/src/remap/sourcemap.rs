//! Standard JSON source maps: base64-VLQ `mappings` decoding and position
//! lookup.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Error raised parsing a source map.
#[derive(Debug, thiserror::Error)]
pub enum SourceMapError {
    #[error("source map is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported source map version {0}")]
    Version(u64),

    #[error("invalid VLQ character {0:?} in mappings")]
    Vlq(char),

    #[error("truncated VLQ sequence in mappings")]
    TruncatedVlq,
}

/// Original position a generated location maps back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalPosition {
    pub source: String,
    /// 1-based.
    pub line: u32,
    /// 0-based, as in the format.
    pub column: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    generated_column: u32,
    source: Option<(u32, u32, u32)>,
    name: Option<u32>,
}

/// A parsed source map.
#[derive(Debug)]
pub struct SourceMap {
    sources: Vec<String>,
    names: Vec<String>,
    /// One vector of segments per generated line, sorted by generated column.
    lines: Vec<Vec<Segment>>,
}

static BASE64_CHARS: Lazy<HashMap<char, i64>> = Lazy::new(|| {
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/"
        .chars()
        .enumerate()
        .map(|(i, c)| (c, i as i64))
        .collect()
});

const VLQ_BASE_SHIFT: u32 = 5;
const VLQ_BASE_MASK: i64 = 0b11111;
const VLQ_CONTINUATION_BIT: i64 = 0b100000;

fn decode_vlq(chars: &mut std::str::Chars<'_>) -> Result<Option<i64>, SourceMapError> {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    let mut seen_any = false;

    loop {
        let Some(c) = chars.next() else {
            if seen_any {
                return Err(SourceMapError::TruncatedVlq);
            }
            return Ok(None);
        };
        let digit = *BASE64_CHARS.get(&c).ok_or(SourceMapError::Vlq(c))?;
        seen_any = true;

        result += (digit & VLQ_BASE_MASK) << shift;
        if digit & VLQ_CONTINUATION_BIT == 0 {
            break;
        }
        shift += VLQ_BASE_SHIFT;
    }

    // Low bit is the sign.
    let value = if result & 1 == 1 {
        -(result >> 1)
    } else {
        result >> 1
    };
    Ok(Some(value))
}

/// Encodes one value as base64 VLQ (used by tests and tooling).
pub fn encode_vlq(value: i64, out: &mut String) {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut vlq = if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    };

    loop {
        let mut digit = vlq & VLQ_BASE_MASK;
        vlq >>= VLQ_BASE_SHIFT;
        if vlq > 0 {
            digit |= VLQ_CONTINUATION_BIT;
        }
        out.push(CHARS[digit as usize] as char);
        if vlq == 0 {
            break;
        }
    }
}

impl SourceMap {
    /// Parses a standard version-3 source map document.
    pub fn parse(json: &str) -> Result<Self, SourceMapError> {
        let doc: serde_json::Value = serde_json::from_str(json)?;

        if let Some(version) = doc.get("version").and_then(serde_json::Value::as_u64) {
            if version != 3 {
                return Err(SourceMapError::Version(version));
            }
        }

        let string_list = |key: &str| -> Vec<String> {
            doc.get(key)
                .and_then(serde_json::Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        let sources = string_list("sources");
        let names = string_list("names");

        let mappings = doc
            .get("mappings")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();

        let mut lines = Vec::new();
        let mut source_index: i64 = 0;
        let mut source_line: i64 = 0;
        let mut source_column: i64 = 0;
        let mut name_index: i64 = 0;

        for line in mappings.split(';') {
            let mut segments = Vec::new();
            let mut generated_column: i64 = 0;

            for segment in line.split(',').filter(|s| !s.is_empty()) {
                let mut chars = segment.chars();

                let Some(col_delta) = decode_vlq(&mut chars)? else {
                    continue;
                };
                generated_column += col_delta;

                let source = match decode_vlq(&mut chars)? {
                    Some(src_delta) => {
                        source_index += src_delta;
                        source_line += decode_vlq(&mut chars)?
                            .ok_or(SourceMapError::TruncatedVlq)?;
                        source_column += decode_vlq(&mut chars)?
                            .ok_or(SourceMapError::TruncatedVlq)?;
                        Some((
                            source_index.max(0) as u32,
                            source_line.max(0) as u32,
                            source_column.max(0) as u32,
                        ))
                    }
                    None => None,
                };

                let name = match decode_vlq(&mut chars)? {
                    Some(name_delta) => {
                        name_index += name_delta;
                        Some(name_index.max(0) as u32)
                    }
                    None => None,
                };

                segments.push(Segment {
                    generated_column: generated_column.max(0) as u32,
                    source,
                    name,
                });
            }

            lines.push(segments);
        }

        Ok(Self {
            sources,
            names,
            lines,
        })
    }

    /// Maps a generated position (1-based line, 1-based column) back to its
    /// original position: the nearest segment at or before the column.
    #[must_use]
    pub fn lookup(&self, line: u32, column: u32) -> Option<OriginalPosition> {
        let segments = self.lines.get(line.checked_sub(1)? as usize)?;
        let column = column.saturating_sub(1);

        let segment = segments
            .iter()
            .rev()
            .find(|s| s.generated_column <= column)?;
        let (source_idx, source_line, source_column) = segment.source?;

        Some(OriginalPosition {
            source: self.sources.get(source_idx as usize)?.clone(),
            line: source_line + 1,
            column: source_column,
            name: segment
                .name
                .and_then(|i| self.names.get(i as usize).cloned()),
        })
    }
}
