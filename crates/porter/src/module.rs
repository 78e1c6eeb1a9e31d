//! A single source file in the module graph.
//!
//! Modules are owned by their packet and referenced everywhere else by
//! [`ModuleKey`], the `(name, version)` of the owning packet plus the
//! canonical module id, so cyclic module graphs never form reference
//! cycles on the heap. The parse results (`code`, `map`, `children`) live
//! behind a lock and are replaced in place on reload.

use std::path::PathBuf;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::packet::PacketKey;
use crate::sourcemap::SourceMap;

/// Canonical extensions module ids collapse into.
pub const SCRIPT_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "json"];
/// Style source extensions.
pub const STYLE_EXTENSIONS: &[&str] = &["css", "less"];

/// Whether a module renders as a script or a stylesheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Script,
    Style,
    /// Delivered as-is, never inlined (e.g. wasm).
    Isolated,
}

/// Globally unique module reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    pub packet: PacketKey,
    pub id: String,
}

impl std::fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.packet, self.id)
    }
}

/// Mutable portion of a module, replaced in place on reload.
#[derive(Debug, Default)]
pub struct ModuleState {
    /// Transpiled output
    pub code: String,
    /// Source map produced by the transpiler, if any
    pub map: Option<SourceMap>,
    /// Ordered resolved dependencies
    pub children: Vec<ModuleKey>,
    /// Raw specifiers in source order, for the loader's dependency list
    pub dependencies: Vec<String>,
    /// Digest of the raw source + transpiler fingerprint
    pub source_hash: String,
    /// Source file mtime at parse time
    pub mtime: Option<SystemTime>,
    /// Entry of a root bundle
    pub is_root_entry: bool,
    /// Listed in the preload configuration
    pub is_preload: bool,
    /// Loaded as a web worker entry
    pub is_worker: bool,
    /// Placeholder generated for an absent module
    pub fake: bool,
    /// Reachable from a preload entry
    pub preloaded: bool,
}

/// One source file with its transpiled form and dependency edges.
#[derive(Debug)]
pub struct Module {
    /// Canonical id, packet-relative, normalized to `.js` / `.css`
    pub id: String,
    /// Path relative to the packet directory (or source root parent for
    /// the root packet), e.g. `components/home.js`
    pub file: String,
    /// Absolute path on disk
    pub fpath: PathBuf,
    /// Owning packet
    pub packet: PacketKey,
    /// Script or style
    pub kind: ModuleKind,
    state: RwLock<ModuleState>,
}

impl Module {
    pub fn new(
        id: String,
        file: String,
        fpath: PathBuf,
        packet: PacketKey,
        kind: ModuleKind,
    ) -> Self {
        Self {
            id,
            file,
            fpath,
            packet,
            kind,
            state: RwLock::new(ModuleState::default()),
        }
    }

    /// Key referencing this module from anywhere in the forest.
    pub fn key(&self) -> ModuleKey {
        ModuleKey {
            packet: self.packet.clone(),
            id: self.id.clone(),
        }
    }

    /// Run `f` with a read lock on the mutable state.
    pub fn with_state<R>(&self, f: impl FnOnce(&ModuleState) -> R) -> R {
        f(&self.state.read())
    }

    /// Run `f` with a write lock on the mutable state.
    pub fn update_state<R>(&self, f: impl FnOnce(&mut ModuleState) -> R) -> R {
        f(&mut self.state.write())
    }

    /// Snapshot of code, map and children taken under one lock, used so a
    /// bundle iteration never interleaves with a reload.
    pub fn snapshot(&self) -> (String, Option<SourceMap>, Vec<ModuleKey>, Vec<String>) {
        let state = self.state.read();
        (
            state.code.clone(),
            state.map.clone(),
            state.children.clone(),
            state.dependencies.clone(),
        )
    }

    pub fn children(&self) -> Vec<ModuleKey> {
        self.state.read().children.clone()
    }

    pub fn source_hash(&self) -> String {
        self.state.read().source_hash.clone()
    }

    pub fn is_preloaded(&self) -> bool {
        let state = self.state.read();
        state.preloaded || state.is_preload
    }

    pub fn is_root_entry(&self) -> bool {
        self.state.read().is_root_entry
    }

    pub fn is_preload(&self) -> bool {
        self.state.read().is_preload
    }

    pub fn is_worker(&self) -> bool {
        self.state.read().is_worker
    }

    pub fn is_fake(&self) -> bool {
        self.state.read().fake
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        self.state.read().mtime
    }
}

/// Collapse an on-disk extension into the canonical module id extension.
///
/// `home.ts` and `home.jsx` both address as `home.js`; `app.less`
/// addresses as `app.css`. Ids carrying no known extension gain `.js`.
pub fn normalize_id(spec: &str) -> String {
    let trimmed = spec.trim_start_matches("./");
    match extension_of(trimmed) {
        Some(ext) if STYLE_EXTENSIONS.contains(&ext) => {
            format!("{}.css", &trimmed[..trimmed.len() - ext.len() - 1])
        }
        Some("json") => trimmed.to_string(),
        Some(ext) if SCRIPT_EXTENSIONS.contains(&ext) => {
            format!("{}.js", &trimmed[..trimmed.len() - ext.len() - 1])
        }
        Some(_) => trimmed.to_string(),
        None => format!("{trimmed}.js"),
    }
}

/// Extension of a path-like id, without the dot.
pub fn extension_of(spec: &str) -> Option<&str> {
    let basename = spec.rsplit('/').next().unwrap_or(spec);
    match basename.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(&basename[idx + 1..]),
    }
}

/// Kind a module id renders as, judged by its on-disk extension.
pub fn kind_of(file: &str) -> ModuleKind {
    match extension_of(file) {
        Some(ext) if STYLE_EXTENSIONS.contains(&ext) => ModuleKind::Style,
        Some("wasm") => ModuleKind::Isolated,
        _ => ModuleKind::Script,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_script_extensions() {
        assert_eq!(normalize_id("home.js"), "home.js");
        assert_eq!(normalize_id("home.ts"), "home.js");
        assert_eq!(normalize_id("home.tsx"), "home.js");
        assert_eq!(normalize_id("home.jsx"), "home.js");
        assert_eq!(normalize_id("./home.mjs"), "home.js");
    }

    #[test]
    fn normalize_collapses_style_extensions() {
        assert_eq!(normalize_id("app.css"), "app.css");
        assert_eq!(normalize_id("app.less"), "app.css");
    }

    #[test]
    fn normalize_keeps_json_and_unknown_extensions() {
        assert_eq!(normalize_id("foo.json"), "foo.json");
        assert_eq!(normalize_id("lib.wasm"), "lib.wasm");
    }

    #[test]
    fn normalize_appends_js_when_extensionless() {
        assert_eq!(normalize_id("home"), "home.js");
        assert_eq!(normalize_id("nested/dir/mod"), "nested/dir/mod.js");
    }

    #[test]
    fn extension_ignores_directories_with_dots() {
        assert_eq!(extension_of("v1.2/file"), None);
        assert_eq!(extension_of("v1.2/file.js"), Some("js"));
        assert_eq!(extension_of(".babelrc"), None);
    }

    #[test]
    fn kind_by_extension() {
        assert_eq!(kind_of("a.css"), ModuleKind::Style);
        assert_eq!(kind_of("a.less"), ModuleKind::Style);
        assert_eq!(kind_of("a.wasm"), ModuleKind::Isolated);
        assert_eq!(kind_of("a.js"), ModuleKind::Script);
        assert_eq!(kind_of("a.json"), ModuleKind::Script);
    }

    #[test]
    fn state_updates_in_place() {
        let module = Module::new(
            "home.js".to_string(),
            "components/home.js".to_string(),
            PathBuf::from("/app/components/home.js"),
            PacketKey::new("app", "1.0.0"),
            ModuleKind::Script,
        );
        module.update_state(|state| {
            state.code = "var a = 1;".to_string();
            state.is_root_entry = true;
        });
        assert!(module.is_root_entry());
        assert_eq!(module.with_state(|s| s.code.clone()), "var a = 1;");
    }
}
