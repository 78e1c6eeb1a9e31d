//! Packets: nodes in the dependency forest.
//!
//! A packet is either the root project or one concrete `name@version` of a
//! dependency. Packets own their modules and bundles; the forest registry
//! on the [`crate::App`] shares dependency packets by `(name, version)` so
//! two importers of the same version get the same node while two different
//! versions stay separate.
//!
//! Parsing is a worklist, not recursion: a module is inserted into `files`
//! before its children are enqueued, and a second visit of an id is a
//! no-op, so cyclic module graphs terminate naturally.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::app::App;
use crate::bundle::{Bundle, BundleFormat};
use crate::cache::source_hash;
use crate::error::{Error, Result};
use crate::module::{kind_of, normalize_id, Module, ModuleKey, ModuleKind};
use crate::resolver::{self, BrowserOverride, ResolveContext};
use crate::transpile::{self, wrap_json, TranspileContext, TranspilerKind};
use crate::watcher::ReloadKind;

/// Identity of a packet across the forest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketKey {
    pub name: String,
    pub version: String,
}

impl PacketKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for PacketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Subset of `package.json` the pipeline reads.
#[derive(Debug, Default)]
struct Manifest {
    name: Option<String>,
    version: Option<String>,
    main: Option<String>,
    browser: BTreeMap<String, BrowserOverride>,
    dependencies: BTreeMap<String, String>,
    raw: Value,
}

impl Manifest {
    async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("package.json");
        let raw: Value = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Value::Null,
            Err(err) => return Err(err.into()),
        };

        let mut manifest = Manifest {
            name: raw
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            version: raw
                .get("version")
                .and_then(Value::as_str)
                .map(str::to_string),
            main: None,
            browser: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            raw: Value::Null,
        };

        if let Some(deps) = raw.get("dependencies").and_then(Value::as_object) {
            for (name, range) in deps {
                if let Some(range) = range.as_str() {
                    manifest.dependencies.insert(name.clone(), range.to_string());
                }
            }
        }

        // The browser field is either an alternate main or an override map.
        match raw.get("browser") {
            Some(Value::String(alt)) => manifest.main = Some(alt.clone()),
            Some(Value::Object(map)) => {
                for (key, value) in map {
                    let over = match value {
                        Value::Bool(false) => BrowserOverride::Disabled,
                        Value::String(path) => BrowserOverride::Redirect(path.clone()),
                        _ => continue,
                    };
                    manifest.browser.insert(key.clone(), over);
                }
            }
            _ => {}
        }
        if manifest.main.is_none() {
            manifest.main = raw.get("main").and_then(Value::as_str).map(str::to_string);
        }

        manifest.raw = raw;
        Ok(manifest)
    }
}

/// A node in the dependency forest: the root project or one
/// `name@version` of a dependency.
pub struct Packet {
    pub(crate) app: Weak<App>,
    pub name: String,
    pub version: String,
    /// Packet directory on disk
    pub dir: PathBuf,
    /// Main entry, as declared (possibly extensionless)
    pub main: String,
    /// `browser` field overrides
    pub browser: BTreeMap<String, BrowserOverride>,
    /// Declared dependency ranges
    pub dependencies: BTreeMap<String, String>,
    pub is_root: bool,
    /// Forms its own bundle boundary (config `bundle.exclude`)
    pub isolated: bool,
    /// Transpiler fixed at prepare time
    pub transpiler: TranspilerKind,
    /// Eligible for transpilation (root, or named in `transpile.include`)
    pub transpile_enabled: bool,
    /// Ordered absolute source roots; a single entry (the packet dir) for
    /// dependency packets
    pub paths: Vec<PathBuf>,
    /// The packet that pulled this one in
    pub parent: Option<PacketKey>,
    files: RwLock<FxHashMap<String, Arc<Module>>>,
    bundles: RwLock<FxHashMap<String, Arc<Bundle>>>,
    /// Ids required from outside the packet, in arrival order; the entry
    /// list of the packet's own bundles
    entries: RwLock<Vec<String>>,
    /// Directory specifiers resolved through an index file
    folder: RwLock<BTreeSet<String>>,
    /// Concrete packet chosen per dependency name, fixed on first use
    resolved_deps: RwLock<FxHashMap<String, PacketKey>>,
}

impl Packet {
    /// Load the root packet for an app.
    pub(crate) async fn load_root(app: &Arc<App>) -> Result<Arc<Packet>> {
        let dir = app.root_dir().to_path_buf();
        let manifest = Manifest::load(&dir).await?;
        let transpiler = transpile::detect(&dir, &manifest.raw);
        let packet = Arc::new(Packet {
            app: Arc::downgrade(app),
            name: manifest.name.unwrap_or_else(|| "app".to_string()),
            version: manifest.version.unwrap_or_else(|| "0.0.0".to_string()),
            main: manifest.main.unwrap_or_else(|| "index.js".to_string()),
            browser: manifest.browser,
            dependencies: manifest.dependencies,
            is_root: true,
            isolated: false,
            transpiler,
            transpile_enabled: true,
            paths: app
                .config
                .paths
                .iter()
                .map(|path| dir.join(path))
                .collect(),
            parent: None,
            dir,
            files: RwLock::new(FxHashMap::default()),
            bundles: RwLock::new(FxHashMap::default()),
            entries: RwLock::new(Vec::new()),
            folder: RwLock::new(BTreeSet::new()),
            resolved_deps: RwLock::new(FxHashMap::default()),
        });
        Ok(app.register_packet(packet))
    }

    /// Load a dependency packet from its directory, registering it in the
    /// forest. Loading the same `(name, version)` twice yields the shared
    /// node.
    pub(crate) async fn load_dep(
        app: &Arc<App>,
        dir: PathBuf,
        parent: &Packet,
    ) -> Result<Arc<Packet>> {
        let manifest = Manifest::load(&dir).await?;
        let name = manifest.name.unwrap_or_else(|| {
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".to_string())
        });
        let version = manifest.version.unwrap_or_else(|| "0.0.0".to_string());

        if let Some(existing) = app.packet(&PacketKey::new(name.clone(), version.clone())) {
            return Ok(existing);
        }

        let transpile_enabled = app.config.transpile.include.iter().any(|n| n == &name);
        let transpiler = if transpile_enabled {
            transpile::detect(&dir, &manifest.raw)
        } else {
            TranspilerKind::None
        };
        let isolated = app.config.bundle.exclude.iter().any(|n| n == &name);

        debug!("loaded packet {name}@{version} from {}", dir.display());
        let packet = Arc::new(Packet {
            app: Arc::downgrade(app),
            name,
            version,
            main: manifest.main.unwrap_or_else(|| "index.js".to_string()),
            browser: manifest.browser,
            dependencies: manifest.dependencies,
            is_root: false,
            isolated,
            transpiler,
            transpile_enabled,
            paths: vec![dir.clone()],
            parent: Some(parent.key()),
            dir,
            files: RwLock::new(FxHashMap::default()),
            bundles: RwLock::new(FxHashMap::default()),
            entries: RwLock::new(Vec::new()),
            folder: RwLock::new(BTreeSet::new()),
            resolved_deps: RwLock::new(FxHashMap::default()),
        });
        Ok(app.register_packet(packet))
    }

    pub fn key(&self) -> PacketKey {
        PacketKey::new(self.name.clone(), self.version.clone())
    }

    /// Invariant: the app owns every packet, so the backlink outlives us.
    pub(crate) fn app(&self) -> Arc<App> {
        self.app.upgrade().expect("app outlives its packets")
    }

    pub fn file(&self, id: &str) -> Option<Arc<Module>> {
        self.files.read().get(id).cloned()
    }

    pub fn file_ids(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.files.read().values().cloned().collect()
    }

    /// Ids required from outside the packet, in arrival order.
    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.read().clone()
    }

    /// Directory specifiers known to be required.
    pub fn folders(&self) -> Vec<String> {
        self.folder.read().iter().cloned().collect()
    }

    /// Concrete versions this packet's bare specifiers resolved to.
    pub fn resolved_dependencies(&self) -> BTreeMap<String, String> {
        self.resolved_deps
            .read()
            .iter()
            .map(|(name, key)| (name.clone(), key.version.clone()))
            .collect()
    }

    /// Get or create the bundle keyed by an output id.
    pub fn bundle(
        self: &Arc<Self>,
        output_id: &str,
        entries: Vec<String>,
        format: BundleFormat,
    ) -> Arc<Bundle> {
        let mut bundles = self.bundles.write();
        if let Some(existing) = bundles.get(output_id) {
            return Arc::clone(existing);
        }
        let bundle = Bundle::new(self, output_id.to_string(), entries, format);
        bundles.insert(output_id.to_string(), Arc::clone(&bundle));
        bundle
    }

    pub fn bundle_for(&self, output_id: &str) -> Option<Arc<Bundle>> {
        self.bundles.read().get(output_id).cloned()
    }

    pub fn bundle_list(&self) -> Vec<Arc<Bundle>> {
        self.bundles.read().values().cloned().collect()
    }

    /// Parse `spec` as an entry of a root bundle.
    pub async fn parse_entry(self: &Arc<Self>, spec: &str) -> Result<Arc<Module>> {
        self.parse_with_flags(spec, EntryFlags {
            is_root_entry: true,
            is_preload: false,
        })
        .await?
        .ok_or_else(|| Error::Resolve {
            specifier: spec.to_string(),
            importer: self.dir.clone(),
        })
    }

    /// Parse `spec` as a preload entry; its closure is marked preloaded.
    pub async fn parse_preload(self: &Arc<Self>, spec: &str) -> Result<Arc<Module>> {
        let module = self
            .parse_with_flags(spec, EntryFlags {
                is_root_entry: true,
                is_preload: true,
            })
            .await?
            .ok_or_else(|| Error::Resolve {
                specifier: spec.to_string(),
                importer: self.dir.clone(),
            })?;
        self.app().mark_preloaded(&module.key());
        Ok(module)
    }

    /// Resolve and parse `spec` plus everything reachable from it.
    /// Unresolved dependencies degrade to placeholder modules; only a
    /// completely unresolvable `spec` itself yields `None`.
    pub async fn parse_file(self: &Arc<Self>, spec: &str) -> Result<Option<Arc<Module>>> {
        self.parse_with_flags(spec, EntryFlags::default()).await
    }

    /// Parse a URL-shaped asset id. Resolution is confined to this
    /// packet's own source roots: a request like `yen/index.js` must not
    /// fall through to dependency resolution, because dependency files are
    /// addressed as `<name>/<version>/<file>`.
    pub async fn parse_asset(self: &Arc<Self>, spec: &str) -> Result<Option<Arc<Module>>> {
        let app = self.app();
        let context = if kind_of(spec) == ModuleKind::Style {
            ResolveContext::Style
        } else {
            ResolveContext::Script
        };
        match resolve_in_packet(&app, self, spec.trim_start_matches('/'), context).await? {
            SpecTarget::Found(pending) => {
                let key = ModuleKey {
                    packet: pending.packet.key(),
                    id: pending.id.clone(),
                };
                run_parse_queue(&app, vec![ParseJob {
                    pending,
                    flags: EntryFlags::default(),
                }])
                .await?;
                Ok(app.module(&key))
            }
            SpecTarget::Unresolved => Ok(None),
        }
    }

    async fn parse_with_flags(
        self: &Arc<Self>,
        spec: &str,
        flags: EntryFlags,
    ) -> Result<Option<Arc<Module>>> {
        let app = self.app();
        let context = if kind_of(spec) == ModuleKind::Style {
            ResolveContext::Style
        } else {
            ResolveContext::Script
        };
        let target = resolve_spec(&app, self, None, spec, context).await?;
        match target {
            SpecTarget::Found(pending) => {
                let key = ModuleKey {
                    packet: pending.packet.key(),
                    id: pending.id.clone(),
                };
                run_parse_queue(&app, vec![ParseJob { pending, flags }]).await?;
                Ok(app.module(&key))
            }
            SpecTarget::Unresolved => Ok(None),
        }
    }

    /// Re-parse the module behind a changed path and invalidate every
    /// bundle whose family contains it. Idempotent: a second event for an
    /// unchanged source is a no-op, which also covers watch backends that
    /// deliver duplicate notifications.
    pub async fn reload(self: &Arc<Self>, kind: ReloadKind, rel_path: &str) -> Result<()> {
        let app = self.app();
        let rel = rel_path.replace('\\', "/");
        let Some(module) = self
            .modules()
            .into_iter()
            .find(|module| module.file == rel)
        else {
            // Not parsed yet; nothing depends on it.
            return Ok(());
        };

        let removed = matches!(kind, ReloadKind::Remove) || !module.fpath.exists();
        if removed {
            module.update_state(|state| {
                state.code = String::new();
                state.map = None;
                state.children = Vec::new();
                state.dependencies = Vec::new();
                state.fake = true;
                state.source_hash = String::new();
            });
            app.invalidate(&module.key()).await;
            return Ok(());
        }

        let source = tokio::fs::read_to_string(&module.fpath).await?;
        let transpiler = app.transpilers().get(self.transpiler);
        let hash = source_hash(&source, &transpiler.fingerprint());
        if hash == module.source_hash() {
            return Ok(());
        }

        debug!("reloading {} in {}", module.id, self.key());
        let parsed = parse_source(&app, self, &module, &source, &hash).await?;
        let mut discovered = Vec::new();
        let children =
            resolve_children(&app, self, &module, &parsed.dependencies, &mut discovered).await?;

        let mtime = tokio::fs::metadata(&module.fpath)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok());
        module.update_state(|state| {
            state.code = parsed.code;
            state.map = parsed.map;
            state.dependencies = parsed.dependencies;
            state.children = children;
            state.source_hash = hash;
            state.fake = false;
            state.mtime = mtime;
        });

        // Children that were not part of the graph yet get parsed now.
        if !discovered.is_empty() {
            let jobs = discovered
                .into_iter()
                .map(|pending| ParseJob {
                    pending,
                    flags: EntryFlags::default(),
                })
                .collect();
            run_parse_queue(&app, jobs).await?;
        }

        // A reloaded preload closure may have grown.
        if module.is_preloaded() {
            app.mark_preloaded(&module.key());
        }

        app.invalidate(&module.key()).await;
        Ok(())
    }

    /// Find (and load) the packet a bare dependency name resolves to from
    /// this packet, walking `node_modules` upward.
    pub async fn dependency(self: &Arc<Self>, name: &str) -> Result<Option<Arc<Packet>>> {
        let app = self.app();
        find_dependency(&app, self, name).await
    }

    /// Map a source-root-relative file path to its module id. For the root
    /// packet the matched source root prefix is stripped; for dependency
    /// packets the file already is the id.
    pub fn id_for_file(&self, file: &str) -> String {
        if self.is_root {
            let app = self.app();
            for root in &app.config.paths {
                let prefix = format!("{root}/");
                if let Some(stripped) = file.strip_prefix(&prefix) {
                    return normalize_id(stripped);
                }
            }
        }
        normalize_id(file)
    }

    fn record_entry(&self, id: &str) {
        let mut entries = self.entries.write();
        if !entries.iter().any(|existing| existing == id) {
            entries.push(id.to_string());
        }
    }

    fn record_folder(&self, dir_spec: &str) {
        self.folder.write().insert(dir_spec.to_string());
    }

    fn insert_module(&self, module: Arc<Module>) {
        self.files.write().insert(module.id.clone(), module);
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("dir", &self.dir)
            .field("is_root", &self.is_root)
            .finish()
    }
}

/// Flags carried by the initial job of a parse.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EntryFlags {
    pub is_root_entry: bool,
    pub is_preload: bool,
}

/// A resolved-but-unparsed module.
pub(crate) struct PendingModule {
    pub packet: Arc<Packet>,
    pub id: String,
    pub file: String,
    pub fpath: PathBuf,
    /// Disabled by a `browser: false` override; parses to an empty module.
    pub disabled: bool,
}

pub(crate) enum SpecTarget {
    Found(PendingModule),
    Unresolved,
}

pub(crate) struct ParseJob {
    pub pending: PendingModule,
    pub flags: EntryFlags,
}

/// Resolve one specifier from `from` (a module of `packet`, absent for
/// entries) to a concrete pending module.
async fn resolve_spec(
    app: &Arc<App>,
    packet: &Arc<Packet>,
    from: Option<&Module>,
    spec: &str,
    context: ResolveContext,
) -> Result<SpecTarget> {
    // Relative specifiers stay within the packet. `Module::file` keeps the
    // source root prefix for root-packet modules, so the join is probed
    // against the packet directory rather than the source roots.
    if spec.starts_with("./") || spec.starts_with("../") {
        let from_dir = from
            .map(|module| dirname(&module.file))
            .unwrap_or_default();
        let Some(rel) = resolver::join_relative(&from_dir, spec) else {
            return Ok(SpecTarget::Unresolved);
        };
        return resolve_project_relative(app, packet, &rel, context).await;
    }

    // Alias prefixes rewrite and restart at the packet root.
    if let Some(rewritten) = resolver::apply_alias(&app.config.resolve.alias, spec) {
        let rel = rewritten.trim_start_matches("./").to_string();
        return resolve_project_relative(app, packet, &rel, context).await;
    }

    // The browser field may disable or redirect a bare dependency name
    // before any packet walk happens.
    match resolver::browser_override(&packet.browser, spec) {
        Some(BrowserOverride::Disabled) => {
            let id = normalize_id(spec);
            return Ok(SpecTarget::Found(PendingModule {
                packet: Arc::clone(packet),
                id: id.clone(),
                fpath: packet.dir.join(&id),
                file: id,
                disabled: true,
            }));
        }
        Some(BrowserOverride::Redirect(redirect)) => {
            let rel = redirect.trim_start_matches("./").to_string();
            return resolve_in_packet(app, packet, &rel, context).await;
        }
        None => {}
    }

    // Bare specifier. The root packet first probes its own source roots so
    // workspace-relative requires keep working.
    if packet.is_root {
        if let SpecTarget::Found(found) = resolve_in_packet(app, packet, spec, context).await? {
            return Ok(SpecTarget::Found(found));
        }
    }

    let (name, subpath) = resolver::split_bare(spec);
    let Some(dep_packet) = find_dependency(app, packet, name).await? else {
        return Ok(SpecTarget::Unresolved);
    };

    let target = match subpath {
        Some(subpath) => subpath.to_string(),
        None => dep_packet.main.trim_start_matches("./").to_string(),
    };
    let resolved = resolve_in_packet(app, &dep_packet, &target, context).await?;
    if let SpecTarget::Found(found) = &resolved {
        // Every id required from outside becomes an entry of the packet's
        // own bundle.
        dep_packet.record_entry(&found.id);
    }
    Ok(resolved)
}

/// Resolve a packet-relative path candidate within `packet`, applying
/// browser overrides and the extension / directory-index rules across its
/// source roots.
async fn resolve_in_packet(
    app: &Arc<App>,
    packet: &Arc<Packet>,
    rel: &str,
    context: ResolveContext,
) -> Result<SpecTarget> {
    let mut target = rel.to_string();

    match resolver::browser_override(&packet.browser, &target) {
        Some(BrowserOverride::Disabled) => {
            let bare_name = target.strip_suffix(".js").unwrap_or(&target);
            if packet.dependencies.contains_key(bare_name) {
                // See DESIGN.md: an override shadowing a declared
                // dependency is surfaced rather than silently diverging.
                warn!(
                    "browser override disables '{target}' which is also a dependency of {}",
                    packet.key()
                );
            }
            let id = normalize_id(&target);
            let fpath = packet.dir.join(&target);
            return Ok(SpecTarget::Found(PendingModule {
                packet: Arc::clone(packet),
                id: id.clone(),
                file: id,
                fpath,
                disabled: true,
            }));
        }
        Some(BrowserOverride::Redirect(redirect)) => {
            target = redirect.trim_start_matches("./").to_string();
        }
        None => {}
    }

    for base in source_bases(app, packet) {
        if let Some(found) = resolver::probe(&base.dir, &target, context).await {
            if found.via_index {
                packet.record_folder(target.trim_end_matches('/'));
            }
            // `file` keeps the source root prefix for the root packet so
            // it stays project-relative; the id does not.
            let file = match &base.prefix {
                Some(prefix) => format!("{prefix}/{}", found.rel),
                None => found.rel.clone(),
            };
            return Ok(SpecTarget::Found(PendingModule {
                packet: Arc::clone(packet),
                id: normalize_id(&found.rel),
                file,
                fpath: found.fpath,
                disabled: false,
            }));
        }
    }
    Ok(SpecTarget::Unresolved)
}

/// Resolve a path that is already project-relative (carries its source
/// root prefix) within the root packet; identical to source-root-relative
/// resolution for dependency packets.
async fn resolve_project_relative(
    app: &Arc<App>,
    packet: &Arc<Packet>,
    rel: &str,
    context: ResolveContext,
) -> Result<SpecTarget> {
    if !packet.is_root {
        return resolve_in_packet(app, packet, rel, context).await;
    }
    if let Some(found) = resolver::probe(&packet.dir, rel, context).await {
        if found.via_index {
            packet.record_folder(packet.id_for_file(rel.trim_end_matches('/')).trim_end_matches(".js"));
        }
        let id = packet.id_for_file(&found.rel);
        return Ok(SpecTarget::Found(PendingModule {
            packet: Arc::clone(packet),
            id,
            file: found.rel.clone(),
            fpath: found.fpath,
            disabled: false,
        }));
    }
    Ok(SpecTarget::Unresolved)
}

struct SourceBase {
    dir: PathBuf,
    /// Prefix the resolved path gains in `Module::file` (the source root
    /// name for the root packet).
    prefix: Option<String>,
}

fn source_bases(app: &Arc<App>, packet: &Packet) -> Vec<SourceBase> {
    if packet.is_root {
        packet
            .paths
            .iter()
            .zip(app.config.paths.iter())
            .map(|(dir, name)| SourceBase {
                dir: dir.clone(),
                prefix: Some(name.clone()),
            })
            .collect()
    } else {
        vec![SourceBase {
            dir: packet.dir.clone(),
            prefix: None,
        }]
    }
}

/// Find the packet a bare specifier names: walk `node_modules` upward from
/// the referring packet's directory. The chosen version is pinned per
/// referring packet so repeated resolutions agree.
async fn find_dependency(
    app: &Arc<App>,
    packet: &Arc<Packet>,
    name: &str,
) -> Result<Option<Arc<Packet>>> {
    if let Some(pinned) = packet.resolved_deps.read().get(name) {
        return Ok(app.packet(pinned));
    }

    let mut current = Some(packet.dir.clone());
    while let Some(dir) = current {
        let candidate = dir.join("node_modules").join(name);
        if tokio::fs::metadata(candidate.join("package.json")).await.is_ok() {
            let dep = Packet::load_dep(app, candidate, packet).await?;
            packet
                .resolved_deps
                .write()
                .insert(name.to_string(), dep.key());
            return Ok(Some(dep));
        }
        current = dir.parent().map(Path::to_path_buf);
    }
    Ok(None)
}

struct ParsedSource {
    code: String,
    map: Option<crate::sourcemap::SourceMap>,
    dependencies: Vec<String>,
}

/// Run matcher and transpiler over one source.
async fn parse_source(
    app: &Arc<App>,
    packet: &Arc<Packet>,
    module: &Module,
    source: &str,
    hash: &str,
) -> Result<ParsedSource> {
    match module.kind {
        ModuleKind::Isolated => Ok(ParsedSource {
            code: String::new(),
            map: None,
            dependencies: Vec::new(),
        }),
        ModuleKind::Style => {
            let dependencies = crate::matcher::find_css_imports(source);
            Ok(ParsedSource {
                code: source.to_string(),
                map: None,
                dependencies,
            })
        }
        ModuleKind::Script => {
            if module.file.ends_with(".json") {
                return Ok(ParsedSource {
                    code: wrap_json(source),
                    map: None,
                    dependencies: Vec::new(),
                });
            }
            let dependencies = crate::matcher::find_all(source);
            if packet.transpile_enabled && packet.transpiler != TranspilerKind::None {
                let transpiler = app.transpilers().get(packet.transpiler);
                let cache_id = format!("{}/{}/{}", packet.name, packet.version, module.id);
                let output = app
                    .cache
                    .transpile_cached(&cache_id, hash, || async {
                        transpiler
                            .transpile(TranspileContext {
                                id: &module.id,
                                fpath: &module.fpath,
                                source,
                            })
                            .await
                    })
                    .await?;
                Ok(ParsedSource {
                    code: output.code.clone(),
                    map: output.map.clone(),
                    dependencies,
                })
            } else {
                Ok(ParsedSource {
                    code: source.to_string(),
                    map: None,
                    dependencies,
                })
            }
        }
    }
}

/// Resolve the child specifiers of a module into keys, installing
/// placeholder modules for the unresolvable ones. Children that are not
/// parsed yet are appended to `discovered` so the caller can enqueue them
/// without resolving twice.
async fn resolve_children(
    app: &Arc<App>,
    packet: &Arc<Packet>,
    module: &Module,
    specs: &[String],
    discovered: &mut Vec<PendingModule>,
) -> Result<Vec<ModuleKey>> {
    let mut children = Vec::with_capacity(specs.len());
    for spec in specs {
        let context = match module.kind {
            ModuleKind::Style => ResolveContext::Style,
            _ => {
                if kind_of(spec) == ModuleKind::Style {
                    ResolveContext::Style
                } else {
                    ResolveContext::Script
                }
            }
        };
        match resolve_spec(app, packet, Some(module), spec, context).await? {
            SpecTarget::Found(pending) => {
                let key = ModuleKey {
                    packet: pending.packet.key(),
                    id: pending.id.clone(),
                };
                let already_queued = discovered
                    .iter()
                    .any(|queued| queued.packet.key() == key.packet && queued.id == key.id);
                if app.module(&key).is_none() && !already_queued {
                    discovered.push(pending);
                }
                children.push(key);
            }
            SpecTarget::Unresolved => {
                warn!(
                    "unable to resolve '{spec}' from {}; installing placeholder",
                    module.fpath.display()
                );
                let fake = install_fake(packet, spec);
                children.push(fake);
            }
        }
    }
    Ok(children)
}

/// Install an empty placeholder module for an unresolvable specifier so
/// the graph stays connected.
fn install_fake(packet: &Arc<Packet>, spec: &str) -> ModuleKey {
    let id = normalize_id(spec);
    if let Some(existing) = packet.file(&id) {
        return existing.key();
    }
    let module = Arc::new(Module::new(
        id.clone(),
        id.clone(),
        packet.dir.join(&id),
        packet.key(),
        kind_of(&id),
    ));
    module.update_state(|state| {
        state.fake = true;
    });
    let key = module.key();
    packet.insert_module(module);
    key
}

/// The worklist engine behind `parse_file` / `parse_entry`.
///
/// Each job creates one module: read, match, transpile, insert, then
/// enqueue unresolved children. Insertion happens before children are
/// processed, so cycles terminate: a queued job whose id is already in
/// `files` only refreshes entry flags.
pub(crate) async fn run_parse_queue(app: &Arc<App>, initial: Vec<ParseJob>) -> Result<()> {
    let mut queue: VecDeque<ParseJob> = initial.into();

    while let Some(job) = queue.pop_front() {
        let ParseJob { pending, flags } = job;
        let packet = pending.packet;

        if let Some(existing) = packet.file(&pending.id) {
            existing.update_state(|state| {
                state.is_root_entry |= flags.is_root_entry;
                state.is_preload |= flags.is_preload;
            });
            continue;
        }

        let module = Arc::new(Module::new(
            pending.id.clone(),
            pending.file.clone(),
            pending.fpath.clone(),
            packet.key(),
            kind_of(&pending.file),
        ));

        if pending.disabled {
            module.update_state(|state| {
                state.is_root_entry = flags.is_root_entry;
                state.is_preload = flags.is_preload;
            });
            packet.insert_module(module);
            continue;
        }

        let source = match module.kind {
            ModuleKind::Isolated => String::new(),
            _ => match tokio::fs::read_to_string(&module.fpath).await {
                Ok(source) => source,
                Err(err) => {
                    warn!(
                        "unable to read {}: {err}; installing placeholder",
                        module.fpath.display()
                    );
                    install_fake(&packet, &pending.id);
                    continue;
                }
            },
        };

        let transpiler = app.transpilers().get(packet.transpiler);
        let hash = source_hash(&source, &transpiler.fingerprint());
        let parsed = parse_source(app, &packet, &module, &source, &hash).await?;
        let mtime = tokio::fs::metadata(&module.fpath)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok());

        module.update_state(|state| {
            state.code = parsed.code;
            state.map = parsed.map;
            state.dependencies = parsed.dependencies.clone();
            state.source_hash = hash;
            state.mtime = mtime;
            state.is_root_entry = flags.is_root_entry;
            state.is_preload = flags.is_preload;
        });

        // Insert before children so cycles find us and stop.
        packet.insert_module(Arc::clone(&module));

        let mut discovered = Vec::new();
        let children =
            resolve_children(app, &packet, &module, &parsed.dependencies, &mut discovered).await?;
        module.update_state(|state| {
            state.children = children;
        });

        for pending in discovered {
            queue.push_back(ParseJob {
                pending,
                flags: EntryFlags::default(),
            });
        }
    }
    Ok(())
}

fn dirname(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_key_display() {
        assert_eq!(PacketKey::new("yen", "1.2.4").to_string(), "yen@1.2.4");
    }

    #[test]
    fn dirname_strips_last_segment() {
        assert_eq!(dirname("components/home.js"), "components");
        assert_eq!(dirname("home.js"), "");
        assert_eq!(dirname("a/b/c.js"), "a/b");
    }

    #[tokio::test]
    async fn manifest_reads_browser_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{
                "name": "ws",
                "version": "3.0.0",
                "main": "./lib/ws.js",
                "browser": { "./lib/ws.js": "./browser.js", "net": false },
                "dependencies": { "ultron": "~1.1.0" }
            }"#,
        )
        .unwrap();
        let manifest = Manifest::load(dir.path()).await.unwrap();
        assert_eq!(manifest.name.as_deref(), Some("ws"));
        assert_eq!(manifest.main.as_deref(), Some("./lib/ws.js"));
        assert_eq!(
            manifest.browser.get("./lib/ws.js"),
            Some(&BrowserOverride::Redirect("./browser.js".to_string()))
        );
        assert_eq!(manifest.browser.get("net"), Some(&BrowserOverride::Disabled));
        assert_eq!(manifest.dependencies.get("ultron").map(String::as_str), Some("~1.1.0"));
    }

    #[tokio::test]
    async fn manifest_browser_string_replaces_main() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{ "name": "pkg", "version": "1.0.0", "main": "node.js", "browser": "web.js" }"#,
        )
        .unwrap();
        let manifest = Manifest::load(dir.path()).await.unwrap();
        assert_eq!(manifest.main.as_deref(), Some("web.js"));
    }

    #[tokio::test]
    async fn manifest_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::load(dir.path()).await.unwrap();
        assert!(manifest.name.is_none());
        assert!(manifest.dependencies.is_empty());
    }
}
