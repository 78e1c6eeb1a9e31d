//! Source map generation, parsing and joining.
//!
//! Implements the standard source map v3 format with VLQ-encoded mappings.
//! Bundling concatenates many transpiled modules into one artifact, so the
//! main entry point here is [`SourceMapBuilder`]: transpiler-produced maps
//! are decoded, shifted by the module's line offset in the bundle, and
//! re-encoded into one merged map; modules without a map of their own get
//! line-by-line identity mappings against their original source path.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;

const BASE64_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Number of lines a chunk of generated code spans past its first line.
pub fn lines_count(text: &str) -> u32 {
    u32::try_from(memchr::memchr_iter(b'\n', text.as_bytes()).count()).unwrap_or(u32::MAX)
}

/// A standard v3 source map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_root: Option<String>,
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources_content: Vec<Option<String>>,
    #[serde(default)]
    pub names: Vec<String>,
    pub mappings: String,
}

/// One decoded mapping segment with absolute positions, 0-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub dst_line: u32,
    pub dst_col: u32,
    pub src_id: u32,
    pub src_line: u32,
    pub src_col: u32,
    pub name_id: Option<u32>,
}

impl SourceMap {
    /// Parse a source map from its JSON serialization.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Drop embedded source text to bound disk use; the paths in `sources`
    /// stay usable for devtools lookups.
    pub fn strip_sources_content(&mut self) {
        self.sources_content.clear();
    }

    /// Decode the VLQ `mappings` string into absolute tokens. Segments that
    /// carry no source reference are skipped; malformed tail segments are
    /// dropped rather than reported.
    pub fn tokens(&self) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut dst_line: u32 = 0;
        let mut dst_col: i64;
        let mut src_id: i64 = 0;
        let mut src_line: i64 = 0;
        let mut src_col: i64 = 0;
        let mut name_id: i64 = 0;

        for line in self.mappings.split(';') {
            dst_col = 0;
            for segment in line.split(',') {
                if segment.is_empty() {
                    continue;
                }
                let mut fields = [0i64; 5];
                let mut count = 0;
                let mut pos = 0;
                while pos < segment.len() && count < 5 {
                    match vlq_decode(segment.as_bytes(), pos) {
                        Some((value, next)) => {
                            fields[count] = value;
                            count += 1;
                            pos = next;
                        }
                        None => break,
                    }
                }
                if count == 0 {
                    continue;
                }
                dst_col += fields[0];
                if count >= 4 {
                    src_id += fields[1];
                    src_line += fields[2];
                    src_col += fields[3];
                    let name = if count >= 5 {
                        name_id += fields[4];
                        Some(name_id as u32)
                    } else {
                        None
                    };
                    if dst_col >= 0 && src_id >= 0 && src_line >= 0 && src_col >= 0 {
                        tokens.push(Token {
                            dst_line,
                            dst_col: dst_col as u32,
                            src_id: src_id as u32,
                            src_line: src_line as u32,
                            src_col: src_col as u32,
                            name_id: name,
                        });
                    }
                }
            }
            dst_line += 1;
        }
        tokens
    }
}

/// Incremental builder producing a merged v3 map.
///
/// Sources and names are interned; tokens may arrive out of order and are
/// sorted by generated position before encoding.
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    sources: Vec<String>,
    source_index: FxHashMap<String, u32>,
    names: Vec<String>,
    name_index: FxHashMap<String, u32>,
    tokens: Vec<Token>,
}

impl SourceMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a source path, returning its index.
    pub fn add_source(&mut self, path: &str) -> u32 {
        if let Some(&id) = self.source_index.get(path) {
            return id;
        }
        let id = self.sources.len() as u32;
        self.sources.push(path.to_string());
        self.source_index.insert(path.to_string(), id);
        id
    }

    /// Intern a symbol name, returning its index.
    pub fn add_name(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.name_index.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.name_index.insert(name.to_string(), id);
        id
    }

    /// Record one mapping from a generated position to an original one.
    pub fn add_token(
        &mut self,
        dst_line: u32,
        dst_col: u32,
        src_id: u32,
        src_line: u32,
        src_col: u32,
        name_id: Option<u32>,
    ) {
        self.tokens.push(Token {
            dst_line,
            dst_col,
            src_id,
            src_line,
            src_col,
            name_id,
        });
    }

    /// Map every line of `code` one-to-one against `source`, starting at
    /// generated line `line_offset`. Used for modules whose transpiler did
    /// not produce a map.
    pub fn add_identity_lines(&mut self, source: &str, code: &str, line_offset: u32) {
        let src_id = self.add_source(source);
        let line_total = lines_count(code) + 1;
        for line in 0..line_total {
            self.add_token(line_offset + line, 0, src_id, line, 0, None);
        }
    }

    /// Merge an existing map in, shifting its generated lines down by
    /// `line_offset`. Source and name indices are re-interned.
    pub fn add_map(&mut self, map: &SourceMap, line_offset: u32) {
        let source_ids: Vec<u32> = map.sources.iter().map(|s| self.add_source(s)).collect();
        let name_ids: Vec<u32> = map.names.iter().map(|n| self.add_name(n)).collect();
        for token in map.tokens() {
            let Some(&src_id) = source_ids.get(token.src_id as usize) else {
                continue;
            };
            let name_id = token
                .name_id
                .and_then(|id| name_ids.get(id as usize).copied());
            self.add_token(
                token.dst_line + line_offset,
                token.dst_col,
                src_id,
                token.src_line,
                token.src_col,
                name_id,
            );
        }
    }

    /// Encode into a finished map.
    pub fn into_map(mut self, file: Option<String>, source_root: Option<String>) -> SourceMap {
        self.tokens
            .sort_by_key(|t| (t.dst_line, t.dst_col, t.src_id, t.src_line, t.src_col));
        self.tokens.dedup();

        let mut mappings = String::new();
        let mut line: u32 = 0;
        let mut prev_dst_col: i64 = 0;
        let mut prev_src_id: i64 = 0;
        let mut prev_src_line: i64 = 0;
        let mut prev_src_col: i64 = 0;
        let mut prev_name_id: i64 = 0;
        let mut first_in_line = true;

        for token in &self.tokens {
            while line < token.dst_line {
                mappings.push(';');
                line += 1;
                prev_dst_col = 0;
                first_in_line = true;
            }
            if !first_in_line {
                mappings.push(',');
            }
            first_in_line = false;

            vlq_encode(i64::from(token.dst_col) - prev_dst_col, &mut mappings);
            prev_dst_col = i64::from(token.dst_col);
            vlq_encode(i64::from(token.src_id) - prev_src_id, &mut mappings);
            prev_src_id = i64::from(token.src_id);
            vlq_encode(i64::from(token.src_line) - prev_src_line, &mut mappings);
            prev_src_line = i64::from(token.src_line);
            vlq_encode(i64::from(token.src_col) - prev_src_col, &mut mappings);
            prev_src_col = i64::from(token.src_col);
            if let Some(name_id) = token.name_id {
                vlq_encode(i64::from(name_id) - prev_name_id, &mut mappings);
                prev_name_id = i64::from(name_id);
            }
        }

        SourceMap {
            version: 3,
            file,
            source_root,
            sources: self.sources,
            sources_content: Vec::new(),
            names: self.names,
            mappings,
        }
    }
}

/// Encode one signed value as base64 VLQ.
fn vlq_encode(value: i64, out: &mut String) {
    let mut vlq = if value < 0 {
        ((-value as u64) << 1) | 1
    } else {
        (value as u64) << 1
    };
    loop {
        let mut digit = (vlq & 0b11111) as usize;
        vlq >>= 5;
        if vlq != 0 {
            digit |= 0b100000;
        }
        out.push(BASE64_CHARS[digit] as char);
        if vlq == 0 {
            break;
        }
    }
}

/// Decode one base64 VLQ value starting at `pos`. Returns the value and the
/// position just past it.
fn vlq_decode(bytes: &[u8], mut pos: usize) -> Option<(i64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *bytes.get(pos)?;
        let digit = BASE64_CHARS.iter().position(|&c| c == byte)? as u64;
        pos += 1;
        result |= (digit & 0b11111) << shift;
        shift += 5;
        if digit & 0b100000 == 0 {
            break;
        }
        if shift > 60 {
            return None;
        }
    }
    let value = if result & 1 == 1 {
        -((result >> 1) as i64)
    } else {
        (result >> 1) as i64
    };
    Some((value, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlq_round_trip() {
        for value in [-1000, -16, -1, 0, 1, 15, 16, 31, 32, 1000, 123456] {
            let mut encoded = String::new();
            vlq_encode(value, &mut encoded);
            let (decoded, pos) = vlq_decode(encoded.as_bytes(), 0).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(pos, encoded.len());
        }
    }

    #[test]
    fn vlq_known_values() {
        // "A" is 0, "C" is 1, "D" is -1 per the spec examples.
        let mut out = String::new();
        vlq_encode(0, &mut out);
        assert_eq!(out, "A");
        out.clear();
        vlq_encode(1, &mut out);
        assert_eq!(out, "C");
        out.clear();
        vlq_encode(-1, &mut out);
        assert_eq!(out, "D");
    }

    #[test]
    fn lines_count_matches_newlines() {
        assert_eq!(lines_count("a\nb\nc"), 2);
        assert_eq!(lines_count("a\nb\nc\n"), 3);
        assert_eq!(lines_count("a"), 0);
        assert_eq!(lines_count(""), 0);
    }

    #[test]
    fn identity_lines_map_every_line() {
        let mut builder = SourceMapBuilder::new();
        builder.add_identity_lines("components/home.js", "var a = 1;\nvar b = 2;", 3);
        let map = builder.into_map(None, Some("/".to_string()));
        let tokens = map.tokens();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].dst_line, 3);
        assert_eq!(tokens[1].dst_line, 4);
        assert_eq!(map.sources, vec!["components/home.js".to_string()]);
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut builder = SourceMapBuilder::new();
        let a = builder.add_source("a.js");
        let b = builder.add_source("b.js");
        let name = builder.add_name("foo");
        builder.add_token(0, 0, a, 0, 0, None);
        builder.add_token(0, 10, a, 0, 4, Some(name));
        builder.add_token(2, 0, b, 5, 2, None);
        let map = builder.into_map(Some("out.js".to_string()), Some("/".to_string()));

        let tokens = map.tokens();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[1].dst_col, 10);
        assert_eq!(tokens[1].src_col, 4);
        assert_eq!(tokens[1].name_id, Some(0));
        assert_eq!(tokens[2].src_id, 1);
        assert_eq!(tokens[2].src_line, 5);
    }

    #[test]
    fn add_map_shifts_lines_and_reinterns() {
        let mut inner = SourceMapBuilder::new();
        let src = inner.add_source("dep.js");
        inner.add_token(0, 0, src, 0, 0, None);
        inner.add_token(1, 2, src, 1, 2, None);
        let inner_map = inner.into_map(None, None);

        let mut outer = SourceMapBuilder::new();
        outer.add_source("main.js");
        outer.add_map(&inner_map, 10);
        let merged = outer.into_map(None, Some("/".to_string()));

        let tokens = merged.tokens();
        assert_eq!(tokens[0].dst_line, 10);
        assert_eq!(tokens[1].dst_line, 11);
        assert_eq!(merged.sources, vec!["main.js".to_string(), "dep.js".to_string()]);
        assert_eq!(tokens[0].src_id, 1);
    }

    #[test]
    fn json_round_trip_keeps_camel_case() {
        let mut builder = SourceMapBuilder::new();
        let src = builder.add_source("components/home.js");
        builder.add_token(0, 0, src, 0, 0, None);
        let map = builder.into_map(Some("home.js".to_string()), Some("/".to_string()));
        let json = map.to_json();
        assert!(json.contains("\"sourceRoot\":\"/\""));
        assert!(!json.contains("sourcesContent"));

        let parsed = SourceMap::from_json(&json).unwrap();
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.sources, map.sources);
        assert_eq!(parsed.mappings, map.mappings);
    }
}
