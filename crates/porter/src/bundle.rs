//! Bundles: deliverable artifacts derived from the module graph.
//!
//! A bundle walks the graph depth-first from its entries, yields each
//! module once in dependency-first order, and serializes the result with a
//! merged source map. For a fixed graph state and configuration the walk
//! and the output bytes are reproducible, which is what makes the content
//! hash a usable cache key.

use std::sync::{Arc, Weak};
use std::time::Duration;

use md5::{Digest, Md5};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use crate::app::App;
use crate::error::{Error, Result};
use crate::loader;
use crate::module::{Module, ModuleKey, ModuleKind};
use crate::packet::{Packet, PacketKey};
use crate::sourcemap::{lines_count, SourceMap, SourceMapBuilder};

/// Debounce window for filesystem-triggered rebuilds.
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Output format of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleFormat {
    Js,
    Css,
}

impl BundleFormat {
    pub fn ext(&self) -> &'static str {
        match self {
            BundleFormat::Js => "js",
            BundleFormat::Css => "css",
        }
    }

    /// Whether a module of `kind` is emitted in this format.
    fn admits(&self, kind: ModuleKind) -> bool {
        match self {
            BundleFormat::Js => matches!(kind, ModuleKind::Script),
            BundleFormat::Css => matches!(kind, ModuleKind::Style),
        }
    }
}

/// How far a `.js` walk reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleScope {
    /// Only the entry module itself.
    Module,
    /// Modules of the owning packet.
    Packet,
    /// Everything reachable, minus isolated packets.
    All,
}

/// Per-call options of [`Bundle::obtain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BundleOptions {
    /// Prepend the runtime loader and append the entry import call. Only
    /// effective when the primary entry is a root entry and not a preload.
    pub loader: bool,
    /// Serve the compacted loader.
    pub minify: bool,
}

/// One rendered artifact.
#[derive(Debug, Clone)]
pub struct BundleOutput {
    pub code: String,
    pub map: SourceMap,
    /// Strong etag, quoted md5 of `code`
    pub etag: String,
    /// First 8 hex chars of md5 of `code`
    pub contenthash: String,
}

#[derive(Debug, Default)]
struct ReloadState {
    generation: u64,
    rebuilding: bool,
    dirty: bool,
}

/// A deliverable artifact: one or more entries of a packet rendered into a
/// single script or stylesheet plus a merged source map.
pub struct Bundle {
    app: Weak<App>,
    pub packet: PacketKey,
    /// Output id within the packet, e.g. `home.js` or `home.css`
    pub id: String,
    pub format: BundleFormat,
    pub scope: BundleScope,
    entries: RwLock<Vec<String>>,
    outputs: RwLock<FxHashMap<BundleOptions, Arc<BundleOutput>>>,
    last_output: RwLock<Option<Arc<BundleOutput>>>,
    build_lock: tokio::sync::Mutex<()>,
    reload_state: Mutex<ReloadState>,
}

impl Bundle {
    pub(crate) fn new(packet: &Arc<Packet>, id: String, entries: Vec<String>, format: BundleFormat) -> Arc<Self> {
        let scope = if packet.is_root {
            BundleScope::All
        } else {
            BundleScope::Packet
        };
        Arc::new(Self {
            app: packet.app.clone(),
            packet: packet.key(),
            id,
            format,
            scope,
            entries: RwLock::new(entries),
            outputs: RwLock::new(FxHashMap::default()),
            last_output: RwLock::new(None),
            build_lock: tokio::sync::Mutex::new(()),
            reload_state: Mutex::new(ReloadState::default()),
        })
    }

    fn app(&self) -> Arc<App> {
        self.app.upgrade().expect("app outlives its bundles")
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.read().clone()
    }

    /// Append an entry, invalidating rendered outputs.
    pub fn add_entry(&self, id: &str) {
        let mut entries = self.entries.write();
        if entries.iter().any(|existing| existing == id) {
            return;
        }
        entries.push(id.to_string());
        drop(entries);
        self.outputs.write().clear();
        *self.last_output.write() = None;
    }

    /// Render the bundle, or return the cached rendering. At most one
    /// build runs at a time; concurrent callers share its output.
    pub async fn obtain(&self, options: BundleOptions) -> Result<Arc<BundleOutput>> {
        let _guard = self.build_lock.lock().await;
        if let Some(cached) = self.outputs.read().get(&options) {
            return Ok(Arc::clone(cached));
        }

        let app = self.app();
        let entries = self.entries();
        let primary = entries
            .first()
            .and_then(|id| app.packet(&self.packet).and_then(|p| p.file(id)));
        let primary_is_root_entry = primary
            .as_ref()
            .map(|module| module.is_root_entry())
            .unwrap_or(false);

        // Root entries force a pack so every reachable packet's artifacts
        // exist on disk before the bundle that references them.
        if primary_is_root_entry {
            Box::pin(app.pack_dependencies()).await?;
        }

        let modules = self.collect(&app)?;
        let output = Arc::new(self.render(&app, &modules, options, primary.as_deref())?);

        self.outputs.write().insert(options, Arc::clone(&output));
        *self.last_output.write() = Some(Arc::clone(&output));
        Ok(output)
    }

    /// The most recently rendered output, if any. The `.map` sibling of an
    /// artifact serves from here.
    pub fn last_output(&self) -> Option<Arc<BundleOutput>> {
        self.last_output.read().clone()
    }

    /// Current content hash, when rendered.
    pub fn contenthash(&self) -> Option<String> {
        self.last_output().map(|output| output.contenthash.clone())
    }

    /// Current etag, when rendered.
    pub fn etag(&self) -> Option<String> {
        self.last_output().map(|output| output.etag.clone())
    }

    /// Public filename: `<entry stem>.<contenthash>.<format>`.
    pub fn output(&self) -> Option<String> {
        let hash = self.contenthash()?;
        let stem = self.id.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(&self.id);
        Some(format!("{stem}.{hash}.{}", self.format.ext()))
    }

    /// Destination-relative path of the artifact.
    pub fn output_path(&self) -> Option<String> {
        let output = self.output()?;
        let app = self.app();
        let packet = app.packet(&self.packet)?;
        if packet.is_root {
            Some(output)
        } else {
            Some(format!("{}/{}/{output}", packet.name, packet.version))
        }
    }

    /// Schedule a rebuild, debounced by [`RELOAD_DEBOUNCE`]: the last event
    /// within the window wins. An event arriving while a rebuild runs marks
    /// the bundle dirty and a second rebuild follows.
    pub fn reload(self: &Arc<Self>) {
        let generation = {
            let mut state = self.reload_state.lock();
            state.generation += 1;
            if state.rebuilding {
                state.dirty = true;
                return;
            }
            state.generation
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            {
                let mut state = this.reload_state.lock();
                if state.generation != generation {
                    // A later event owns the rebuild.
                    return;
                }
                state.rebuilding = true;
            }
            loop {
                if let Err(err) = this.rebuild().await {
                    warn!("rebuild of {} failed: {err}", this.id);
                    this.reload_state.lock().dirty = true;
                    break;
                }
                let mut state = this.reload_state.lock();
                if state.dirty {
                    state.dirty = false;
                    continue;
                }
                state.rebuilding = false;
                break;
            }
        });
    }

    /// Drop stale outputs and render afresh.
    async fn rebuild(&self) -> Result<()> {
        let app = self.app();
        let stale_path = {
            let _guard = self.build_lock.lock().await;
            let stale = self.output_path();
            self.outputs.write().clear();
            *self.last_output.write() = None;
            stale
        };
        if let Some(rel) = stale_path {
            let path = app.cache.dest().join(&rel);
            let _ = tokio::fs::remove_file(&path).await;
            let _ = tokio::fs::remove_file(path.with_extension(
                format!("{}.map", self.format.ext()),
            ))
            .await;
        }
        self.obtain(BundleOptions::default()).await?;
        Ok(())
    }

    /// Deterministic walk yielding each emitted module once.
    ///
    /// Depth-first over children; a module is visited at most once. For
    /// `.js`, after the entry is yielded its children are walked a second
    /// time to pick up dependencies introduced by transpiler helpers.
    fn collect(&self, app: &App) -> Result<Vec<Arc<Module>>> {
        let Some(owner) = app.packet(&self.packet) else {
            return Ok(Vec::new());
        };
        let mut visited: FxHashSet<ModuleKey> = FxHashSet::default();
        let mut out: Vec<Arc<Module>> = Vec::new();

        for entry_id in self.entries() {
            let Some(entry) = owner.file(&entry_id) else {
                match self.format {
                    BundleFormat::Js => {
                        return Err(Error::Bundle {
                            entry: entry_id,
                            packet: self.packet.to_string(),
                        })
                    }
                    // A missing CSS companion renders empty.
                    BundleFormat::Css => continue,
                }
            };
            let entry_key = entry.key();
            if visited.contains(&entry_key) {
                continue;
            }

            // Preloaded modules stay out of ordinary bundles; they are
            // reachable again from preload, placeholder and worker entries,
            // and inside isolated packets.
            let admit_preloaded = entry.is_preload()
                || entry.is_fake()
                || entry.is_worker()
                || owner.isolated;

            for child in entry.children() {
                self.walk(app, &child, admit_preloaded, &mut visited, &mut out);
            }
            if visited.insert(entry_key) && self.format.admits(entry.kind) {
                out.push(Arc::clone(&entry));
            }
            if self.format == BundleFormat::Js {
                for child in entry.children() {
                    self.walk(app, &child, admit_preloaded, &mut visited, &mut out);
                }
            }
        }
        Ok(out)
    }

    fn walk(
        &self,
        app: &App,
        key: &ModuleKey,
        admit_preloaded: bool,
        visited: &mut FxHashSet<ModuleKey>,
        out: &mut Vec<Arc<Module>>,
    ) {
        if visited.contains(key) {
            return;
        }
        let Some(module) = app.module(key) else {
            return;
        };

        if self.format == BundleFormat::Js {
            // Module scope yields only the entry, handled by the caller.
            if self.scope == BundleScope::Module {
                return;
            }
            let foreign = key.packet != self.packet;
            if foreign {
                if self.scope != BundleScope::All {
                    return;
                }
                // Isolated child packets form their own bundle boundary.
                if app
                    .packet(&key.packet)
                    .map(|packet| packet.isolated)
                    .unwrap_or(false)
                {
                    return;
                }
            }
            if module.is_preloaded() && !admit_preloaded {
                return;
            }
        }

        // Never inlined; the artifact is delivered as its own file.
        if module.kind == ModuleKind::Isolated {
            visited.insert(key.clone());
            return;
        }

        visited.insert(key.clone());
        for child in module.children() {
            self.walk(app, &child, admit_preloaded, visited, out);
        }
        if self.format.admits(module.kind) {
            out.push(module);
        }
    }

    /// Serialize the walked modules into code plus a merged source map.
    fn render(
        &self,
        app: &App,
        modules: &[Arc<Module>],
        options: BundleOptions,
        primary: Option<&Module>,
    ) -> Result<BundleOutput> {
        let mut code = String::new();
        let mut builder = SourceMapBuilder::new();
        let mut line: u32 = 0;

        let primary_is_root_entry = primary.map(Module::is_root_entry).unwrap_or(false);
        let primary_is_preload = primary.map(Module::is_preload).unwrap_or(false);
        let inject_loader = options.loader
            && primary_is_root_entry
            && !primary_is_preload
            && self.format == BundleFormat::Js;

        if inject_loader {
            let loader_source = loader::source(options.minify);
            builder.add_identity_lines("loader.js", loader_source, line);
            code.push_str(loader_source);
            if !code.ends_with('\n') {
                code.push('\n');
            }
            line = lines_count(&code);
        }

        if primary_is_root_entry && self.format == BundleFormat::Js {
            // The client resolves `(name, version)` at require sites
            // through this snapshot.
            let lock_line = format!(
                "Object.assign(porter.lock, {});\n",
                serde_json::to_string(&app.lock_json())?
            );
            code.push_str(&lock_line);
            line += 1;
        }

        for module in modules {
            let (module_code, module_map, _children, dependencies) = module.snapshot();
            match self.format {
                BundleFormat::Js => {
                    code.push_str(&format!(
                        "porter.define({}, {}, function(module, exports, require) {{\n",
                        serde_json::to_string(&define_id(app, module))?,
                        serde_json::to_string(&dependencies)?,
                    ));
                    line += 1;
                    match &module_map {
                        Some(map) => builder.add_map(map, line),
                        None => {
                            builder.add_identity_lines(&source_path(app, module), &module_code, line)
                        }
                    }
                    code.push_str(&module_code);
                    if !code.ends_with('\n') {
                        code.push('\n');
                    }
                    line = lines_count(&code);
                    code.push_str("});\n");
                    line += 1;
                }
                BundleFormat::Css => {
                    match &module_map {
                        Some(map) => builder.add_map(map, line),
                        None => {
                            builder.add_identity_lines(&source_path(app, module), &module_code, line)
                        }
                    }
                    code.push_str(&module_code);
                    if !code.ends_with('\n') {
                        code.push('\n');
                    }
                    line = lines_count(&code);
                }
            }
        }

        if inject_loader {
            if let Some(primary) = primary {
                code.push_str(&format!(
                    "porter.import({});\n",
                    serde_json::to_string(&primary.id)?
                ));
            }
        }

        let source_root = app
            .config
            .source
            .root
            .clone()
            .unwrap_or_else(|| "/".to_string());
        let map = builder.into_map(Some(self.id.clone()), Some(source_root));

        let digest = md5_hex(code.as_bytes());
        Ok(BundleOutput {
            etag: format!("\"{digest}\""),
            contenthash: digest[..8].to_string(),
            code,
            map,
        })
    }
}

/// Id a module registers under in the client loader: plain for the root
/// packet, `name/version/id` for dependencies.
fn define_id(app: &App, module: &Module) -> String {
    match app.packet(&module.packet) {
        Some(packet) if !packet.is_root => {
            format!("{}/{}/{}", packet.name, packet.version, module.id)
        }
        _ => module.id.clone(),
    }
}

/// Project-relative path used in source maps: `components/home.js` for the
/// root packet, `node_modules/react/index.js` for dependencies.
fn source_path(app: &App, module: &Module) -> String {
    if let Ok(rel) = module.fpath.strip_prefix(app.root_dir()) {
        let mut out = String::new();
        for component in rel.components() {
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&component.as_os_str().to_string_lossy());
        }
        if !out.is_empty() {
            return out;
        }
    }
    module.file.clone()
}

/// Lowercase hex md5 of `bytes`.
pub fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
