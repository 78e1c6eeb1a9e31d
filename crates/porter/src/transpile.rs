//! Transpiler interface and built-in backends.
//!
//! The pipeline consumes transpilers through a narrow async trait so that
//! Babel-like or TypeScript-like backends can be plugged in without the
//! graph engine knowing anything about them. Selection happens once per
//! packet during prepare: the packet directory and manifest are inspected
//! for a transpiler configuration and the chosen kind is fixed for the
//! packet's lifetime.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::Result;
use crate::sourcemap::SourceMap;

/// Which transpiler a packet is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TranspilerKind {
    /// No transpiler configured; scripts pass through untouched.
    #[default]
    None,
    /// A babel-style configuration was found.
    Babel,
    /// A `tsconfig.json` was found.
    TypeScript,
}

impl TranspilerKind {
    /// Stable name used in cache fingerprints and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TranspilerKind::None => "none",
            TranspilerKind::Babel => "babel",
            TranspilerKind::TypeScript => "typescript",
        }
    }
}

/// Babel config file variants probed in order.
const BABEL_CONFIGS: &[&str] = &[".babelrc", ".babelrc.js", ".babelrc.json", "babel.config.js"];

/// Inspect a packet directory and manifest for a transpiler configuration.
pub fn detect(dir: &Path, manifest: &Value) -> TranspilerKind {
    if manifest.get("babel").is_some() {
        return TranspilerKind::Babel;
    }
    for name in BABEL_CONFIGS {
        if dir.join(name).exists() {
            return TranspilerKind::Babel;
        }
    }
    if dir.join("tsconfig.json").exists() {
        return TranspilerKind::TypeScript;
    }
    TranspilerKind::None
}

/// Everything a backend needs to transform one module.
pub struct TranspileContext<'a> {
    /// Canonical module id within its packet
    pub id: &'a str,
    /// Absolute path of the source file
    pub fpath: &'a Path,
    /// Raw source text
    pub source: &'a str,
}

/// Output of one transpilation.
#[derive(Debug, Clone)]
pub struct TranspileOutput {
    pub code: String,
    pub map: Option<SourceMap>,
}

/// Narrow interface to a transpiler backend.
#[async_trait]
pub trait Transpiler: Send + Sync {
    /// Backend name, part of the cache fingerprint.
    fn name(&self) -> &'static str;

    /// Option fingerprint, part of the cache fingerprint. Backends with
    /// tunable options must fold them in here so option changes invalidate
    /// cached outputs.
    fn fingerprint(&self) -> String {
        self.name().to_string()
    }

    async fn transpile(&self, ctx: TranspileContext<'_>) -> Result<TranspileOutput>;
}

/// Pass-through backend: emits the source unchanged with no map, leaving
/// the bundler to line-map the module against its original path.
pub struct Passthrough;

#[async_trait]
impl Transpiler for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    async fn transpile(&self, ctx: TranspileContext<'_>) -> Result<TranspileOutput> {
        Ok(TranspileOutput {
            code: ctx.source.to_string(),
            map: None,
        })
    }
}

/// Registry mapping a packet's [`TranspilerKind`] to a backend instance.
///
/// Defaults to pass-through backends for every kind; applications embedding
/// real Babel or TypeScript bridges replace the relevant slots.
#[derive(Clone)]
pub struct TranspilerRegistry {
    backends: FxHashMap<TranspilerKind, Arc<dyn Transpiler>>,
}

impl TranspilerRegistry {
    pub fn new() -> Self {
        let mut backends: FxHashMap<TranspilerKind, Arc<dyn Transpiler>> = FxHashMap::default();
        let passthrough: Arc<dyn Transpiler> = Arc::new(Passthrough);
        backends.insert(TranspilerKind::None, Arc::clone(&passthrough));
        backends.insert(TranspilerKind::Babel, Arc::clone(&passthrough));
        backends.insert(TranspilerKind::TypeScript, passthrough);
        Self { backends }
    }

    /// Replace the backend for one kind.
    pub fn register(&mut self, kind: TranspilerKind, backend: Arc<dyn Transpiler>) {
        self.backends.insert(kind, backend);
    }

    /// Backend for a kind. Every kind has at least the pass-through.
    pub fn get(&self, kind: TranspilerKind) -> Arc<dyn Transpiler> {
        self.backends
            .get(&kind)
            .or_else(|| self.backends.get(&TranspilerKind::None))
            .cloned()
            .unwrap_or_else(|| Arc::new(Passthrough))
    }
}

impl Default for TranspilerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a JSON document as a CommonJS module.
pub fn wrap_json(source: &str) -> String {
    format!("module.exports = {};", source.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn detect_prefers_manifest_babel_field() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tsconfig.json"), "{}").unwrap();
        let manifest: Value = serde_json::json!({ "babel": { "presets": [] } });
        assert_eq!(detect(dir.path(), &manifest), TranspilerKind::Babel);
    }

    #[test]
    fn detect_finds_babelrc() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".babelrc"), "{}").unwrap();
        assert_eq!(
            detect(dir.path(), &Value::Null),
            TranspilerKind::Babel
        );
    }

    #[test]
    fn detect_finds_tsconfig() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tsconfig.json"), "{}").unwrap();
        assert_eq!(detect(dir.path(), &Value::Null), TranspilerKind::TypeScript);
    }

    #[test]
    fn detect_defaults_to_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect(dir.path(), &Value::Null), TranspilerKind::None);
    }

    #[tokio::test]
    async fn passthrough_keeps_source() {
        let output = Passthrough
            .transpile(TranspileContext {
                id: "home.js",
                fpath: Path::new("/tmp/home.js"),
                source: "var a = 1;",
            })
            .await
            .unwrap();
        assert_eq!(output.code, "var a = 1;");
        assert!(output.map.is_none());
    }

    #[test]
    fn json_wrap_produces_module() {
        assert_eq!(
            wrap_json("{\"foo\":1,\"bar\":true}\n"),
            "module.exports = {\"foo\":1,\"bar\":true};"
        );
    }

    #[test]
    fn registry_always_resolves() {
        let registry = TranspilerRegistry::new();
        assert_eq!(registry.get(TranspilerKind::Babel).name(), "passthrough");
        assert_eq!(registry.get(TranspilerKind::None).name(), "passthrough");
    }
}
