//! The client-side runtime loader and its configuration descriptor.
//!
//! The loader source ships with the crate and is prepended to root-entry
//! bundles (or served standalone as `loader.js` with the app's descriptor
//! appended). Minified serving uses a compacted variant: comments and
//! indentation dropped, which keeps the artifact debuggable while staying
//! small enough for the hot path.

use std::sync::OnceLock;

/// Runtime loader source, verbatim.
pub const LOADER_SOURCE: &str = include_str!("../assets/loader.js");

/// Service worker source served as `porter-sw.js`.
pub const SERVICE_WORKER_SOURCE: &str = include_str!("../assets/porter-sw.js");

/// Loader source, compacted when `minify` is set.
pub fn source(minify: bool) -> &'static str {
    if !minify {
        return LOADER_SOURCE;
    }
    static COMPACTED: OnceLock<String> = OnceLock::new();
    COMPACTED.get_or_init(|| compact(LOADER_SOURCE))
}

/// Strip comments, indentation and blank lines. The loader contains no
/// multi-line strings, so line-level compaction is safe.
fn compact(source: &str) -> String {
    let mut out = String::with_capacity(source.len() / 2);
    let mut in_block_comment = false;
    for line in source.lines() {
        let mut trimmed = line.trim();
        if in_block_comment {
            match trimmed.find("*/") {
                Some(end) => {
                    trimmed = trimmed[end + 2..].trim();
                    in_block_comment = false;
                }
                None => continue,
            }
        }
        if let Some(start) = trimmed.find("/*") {
            match trimmed[start..].find("*/") {
                Some(end) => {
                    let rest = &trimmed[start + end + 2..];
                    let head = &trimmed[..start];
                    if head.trim().is_empty() && rest.trim().is_empty() {
                        continue;
                    }
                }
                None => {
                    in_block_comment = true;
                    trimmed = trimmed[..start].trim();
                }
            }
        }
        if trimmed.is_empty() || trimmed.starts_with("//") {
            continue;
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    out
}
