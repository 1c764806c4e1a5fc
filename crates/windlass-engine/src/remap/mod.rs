//! Stack-trace remapping.
//!
//! User errors surface with stacks pointing into the compiled bundle. Before
//! a stack is persisted it is rewritten frame by frame: frames inside a
//! bundle with an inline source map are mapped back to original source
//! locations, frames from the runtime's own synthetic files are elided, and
//! everything else passes through untouched.

pub mod sourcemap;

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

pub use sourcemap::{OriginalPosition, SourceMap, SourceMapError};

/// `at name (file:line:col)` or `at file:line:col`.
static FRAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\s*)at\s+(?:(.+?)\s+\()?(.+?):(\d+):(\d+)\)?\s*$").expect("frame regex")
});

static INLINE_MAP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"//[#@]\s*sourceMappingURL=data:application/json[^,]*;base64,([A-Za-z0-9+/=]+)")
        .expect("source map comment regex")
});

/// Synthetic file names whose frames are dropped entirely.
const SYNTHETIC_FILES: &[&str] = &["<sandbox>", "windlass:engine", "windlass:runtime"];

/// Rewrites bundle stacks back to user source.
#[derive(Debug, Default)]
pub struct StackRemapper {
    maps: HashMap<String, SourceMap>,
}

impl StackRemapper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a bundle by filename, extracting its inline source-map
    /// comment. Bundles without one are simply never remapped.
    pub fn add_bundle(&mut self, filename: impl Into<String>, bundle_source: &str) {
        let filename = filename.into();
        let Some(captures) = INLINE_MAP_RE.captures(bundle_source) else {
            debug!(%filename, "bundle has no inline source map");
            return;
        };
        let Ok(decoded) = BASE64.decode(captures[1].as_bytes()) else {
            debug!(%filename, "inline source map is not valid base64");
            return;
        };
        let Ok(text) = String::from_utf8(decoded) else {
            debug!(%filename, "inline source map is not UTF-8");
            return;
        };
        match SourceMap::parse(&text) {
            Ok(map) => {
                self.maps.insert(filename, map);
            }
            Err(err) => debug!(%filename, %err, "inline source map failed to parse"),
        }
    }

    /// Registers an already-parsed map for a filename.
    pub fn add_map(&mut self, filename: impl Into<String>, map: SourceMap) {
        self.maps.insert(filename.into(), map);
    }

    /// Rewrites every frame of a stack string.
    #[must_use]
    pub fn remap(&self, stack: &str) -> String {
        let mut out = Vec::new();

        for line in stack.lines() {
            let Some(captures) = FRAME_RE.captures(line) else {
                out.push(line.to_string());
                continue;
            };

            let indent = &captures[1];
            let function = captures.get(2).map(|m| m.as_str());
            let file = &captures[3];
            let line_no: u32 = captures[4].parse().unwrap_or(0);
            let col_no: u32 = captures[5].parse().unwrap_or(0);

            if SYNTHETIC_FILES.contains(&file) {
                continue;
            }

            let Some(position) = self
                .maps
                .get(file)
                .and_then(|map| map.lookup(line_no, col_no))
            else {
                out.push(line.to_string());
                continue;
            };

            let function = position
                .name
                .as_deref()
                .or(function)
                .unwrap_or("<anonymous>");
            out.push(format!(
                "{indent}at {function} ({}:{}:{})",
                position.source, position.line, position.column
            ));
        }

        out.join("\n")
    }
}
