//! The application root: configuration, the packet forest, the shared
//! cache, and the read/serve contract.
//!
//! One [`App`] owns one project. `App::new` loads the root packet, parses
//! the configured entries and preloads, and purges the destination
//! directory unless the cache is persisted. `read_asset` is the single
//! entry point the HTTP layer calls: it dispatches special ids (loader,
//! config descriptor, service worker, source maps, dependency paths) and
//! renders bundles on demand.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::bundle::{md5_hex, Bundle, BundleFormat, BundleOptions};
use crate::cache::Cache;
use crate::config::AppConfig;
use crate::error::Result;
use crate::loader;
use crate::module::{kind_of, normalize_id, Module, ModuleKey, ModuleKind};
use crate::packet::{Packet, PacketKey};
use crate::watcher::{ReloadKind, Watcher};

/// A rendered response body plus the headers the HTTP layer derives from it.
#[derive(Debug, Clone)]
pub struct Asset {
    pub content: Vec<u8>,
    pub content_type: &'static str,
    /// Strong etag, quoted
    pub etag: String,
    pub mtime: Option<SystemTime>,
}

impl Asset {
    fn new(content: Vec<u8>, content_type: &'static str, mtime: Option<SystemTime>) -> Self {
        let etag = format!("\"{}\"", md5_hex(&content));
        Self {
            content,
            content_type,
            etag,
            mtime,
        }
    }
}

/// Root holder of configuration, preload set, shared cache and the packet
/// forest.
pub struct App {
    pub config: AppConfig,
    pub cache: Cache,
    root_dir: PathBuf,
    transpilers: crate::transpile::TranspilerRegistry,
    packets: RwLock<FxHashMap<PacketKey, Arc<Packet>>>,
    root: RwLock<Option<Arc<Packet>>>,
    watcher: Mutex<Option<Watcher>>,
}

impl App {
    /// Build an app: load the root packet, purge the cache unless
    /// persisted, and parse the configured preloads and entries.
    pub async fn new(config: AppConfig) -> Result<Arc<App>> {
        Self::with_transpilers(config, crate::transpile::TranspilerRegistry::new()).await
    }

    /// Like [`App::new`] with custom transpiler backends.
    pub async fn with_transpilers(
        config: AppConfig,
        transpilers: crate::transpile::TranspilerRegistry,
    ) -> Result<Arc<App>> {
        config.validate()?;
        let root_dir = config.resolved_root();
        let cache = Cache::new(config.resolved_dest())?;

        let app = Arc::new(App {
            root_dir,
            cache,
            transpilers,
            packets: RwLock::new(FxHashMap::default()),
            root: RwLock::new(None),
            watcher: Mutex::new(None),
            config,
        });

        if !app.config.cache.persist {
            app.cache.remove_all(&app.config.cache.except).await?;
        }

        let root = Packet::load_root(&app).await?;
        *app.root.write() = Some(root);
        app.prepare().await?;
        Ok(app)
    }

    async fn prepare(self: &Arc<Self>) -> Result<()> {
        let root = self.root_packet();

        for spec in self.config.preload.clone() {
            let module = root.parse_preload(&spec).await?;
            root.bundle(&module.id, vec![module.id.clone()], format_of(&module.id));
        }

        let entries = if self.config.entries.is_empty() {
            self.scan_entries().await
        } else {
            self.config.entries.clone()
        };
        for spec in entries {
            let module = root.parse_entry(&spec).await?;
            root.bundle(&module.id, vec![module.id.clone()], format_of(&module.id));
        }
        info!(
            "prepared {} with {} packet(s)",
            root.name,
            self.packets.read().len()
        );
        Ok(())
    }

    /// Default entry set: every `.js` file directly under the first source
    /// root.
    async fn scan_entries(&self) -> Vec<String> {
        let root = self.root_packet();
        let Some(first) = root.paths.first() else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        if let Ok(mut dir) = tokio::fs::read_dir(first).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".js") && !name.starts_with('.') {
                    entries.push(name);
                }
            }
        }
        entries.sort();
        entries
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn transpilers(&self) -> &crate::transpile::TranspilerRegistry {
        &self.transpilers
    }

    /// The root packet. Available from `App::new` on.
    pub fn root_packet(&self) -> Arc<Packet> {
        self.root
            .read()
            .clone()
            .expect("root packet loaded during App::new")
    }

    pub fn packet(&self, key: &PacketKey) -> Option<Arc<Packet>> {
        self.packets.read().get(key).cloned()
    }

    pub fn packets(&self) -> Vec<Arc<Packet>> {
        self.packets.read().values().cloned().collect()
    }

    /// Register a packet, deduplicating on `(name, version)`.
    pub(crate) fn register_packet(&self, packet: Arc<Packet>) -> Arc<Packet> {
        let key = packet.key();
        let mut packets = self.packets.write();
        if let Some(existing) = packets.get(&key) {
            return Arc::clone(existing);
        }
        packets.insert(key, Arc::clone(&packet));
        packet
    }

    pub fn module(&self, key: &ModuleKey) -> Option<Arc<Module>> {
        self.packet(&key.packet)?.file(&key.id)
    }

    /// Flattened `(name, version) → metadata` table the client uses for
    /// runtime version dispatch.
    pub fn lock_json(&self) -> Value {
        let mut lock = serde_json::Map::new();
        for packet in self.packets() {
            let mut meta = serde_json::Map::new();
            meta.insert("main".to_string(), json!(normalize_id(&packet.main)));
            let dependencies = packet.resolved_dependencies();
            if !dependencies.is_empty() {
                meta.insert("dependencies".to_string(), json!(dependencies));
            }
            let folders = packet.folders();
            if !folders.is_empty() {
                meta.insert("folder".to_string(), json!(folders));
            }
            let versions = lock
                .entry(packet.name.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(versions) = versions {
                versions.insert(packet.version.clone(), Value::Object(meta));
            }
        }
        Value::Object(lock)
    }

    /// Descriptor appended to `loader.js` and served as
    /// `loaderConfig.json`.
    pub fn loader_config(&self) -> Value {
        let root = self.root_packet();
        json!({
            "name": root.name,
            "version": root.version,
            "main": normalize_id(&root.main),
            "preload": self.config.preload.iter().map(|p| normalize_id(p)).collect::<Vec<_>>(),
            "lock": self.lock_json(),
        })
    }

    /// Mark the transitive closure of `key` as preloaded.
    pub(crate) fn mark_preloaded(&self, key: &ModuleKey) {
        let mut visited: FxHashSet<ModuleKey> = FxHashSet::default();
        let mut queue = vec![key.clone()];
        while let Some(current) = queue.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(module) = self.module(&current) else {
                continue;
            };
            module.update_state(|state| {
                state.preloaded = true;
            });
            queue.extend(module.children());
        }
    }

    /// Schedule a rebuild of every bundle whose transitive family contains
    /// `key`. Each module is visited at most once per bundle.
    pub(crate) async fn invalidate(&self, key: &ModuleKey) {
        for packet in self.packets() {
            for bundle in packet.bundle_list() {
                if self.family_contains(&bundle, key) {
                    bundle.reload();
                }
            }
        }
    }

    fn family_contains(&self, bundle: &Arc<Bundle>, key: &ModuleKey) -> bool {
        let Some(owner) = self.packet(&bundle.packet) else {
            return false;
        };
        let mut visited: FxHashSet<ModuleKey> = FxHashSet::default();
        let mut queue: Vec<ModuleKey> = bundle
            .entries()
            .into_iter()
            .filter_map(|id| owner.file(&id).map(|module| module.key()))
            .collect();
        while let Some(current) = queue.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if current == *key {
                return true;
            }
            if let Some(module) = self.module(&current) {
                queue.extend(module.children());
            }
        }
        false
    }

    /// Write every dependency packet's artifacts under `dest` so root
    /// bundles can reference them.
    pub async fn pack_dependencies(&self) -> Result<()> {
        for packet in self.packets() {
            if packet.is_root {
                continue;
            }
            self.pack_packet(&packet).await?;
        }
        Ok(())
    }

    async fn pack_packet(&self, packet: &Arc<Packet>) -> Result<()> {
        let entry_ids = packet.entry_ids();
        let mut by_format: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        for id in entry_ids {
            by_format
                .entry(format_of(&id).ext())
                .or_default()
                .push(id);
        }
        for (_ext, entries) in by_format {
            let Some(first) = entries.first().cloned() else {
                continue;
            };
            let bundle = packet.bundle(&first, entries.clone(), format_of(&first));
            for id in &entries {
                bundle.add_entry(id);
            }
            let output = bundle.obtain(BundleOptions::default()).await?;
            if let Some(path) = bundle.output_path() {
                self.cache
                    .write_file(&path, output.code.clone().into_bytes())
                    .await?;
                self.cache
                    .write_file(&format!("{path}.map"), output.map.to_json().into_bytes())
                    .await?;
            }
        }
        Ok(())
    }

    /// Precompile every root bundle and the dependency artifacts, and
    /// write the manifest mapping entry ids to hashed filenames.
    pub async fn compile_all(&self, minify: bool) -> Result<()> {
        self.pack_dependencies().await?;
        let root = self.root_packet();
        let mut manifest = BTreeMap::new();

        for bundle in root.bundle_list() {
            let options = BundleOptions {
                loader: !bundle
                    .entries()
                    .first()
                    .and_then(|id| root.file(id))
                    .map(|module| module.is_preload())
                    .unwrap_or(false),
                minify,
            };
            let output = bundle.obtain(options).await?;
            let Some(path) = bundle.output_path() else {
                continue;
            };
            self.cache
                .write_file(&path, output.code.clone().into_bytes())
                .await?;
            self.cache
                .write_file(&format!("{path}.map"), output.map.to_json().into_bytes())
                .await?;
            manifest.insert(bundle.id.clone(), path);
        }

        self.cache
            .write_file("manifest.json", serde_json::to_vec_pretty(&manifest)?)
            .await?;
        info!("compiled {} bundle(s)", manifest.len());
        Ok(())
    }

    /// Start watching the source roots. Backend failure logs a warning and
    /// leaves hot reload disabled.
    pub fn watch(self: &Arc<Self>) {
        match Watcher::new(Arc::clone(self)) {
            Ok(watcher) => *self.watcher.lock() = Some(watcher),
            Err(err) => warn!("file watching unavailable, hot reload disabled: {err}"),
        }
    }

    /// Stop watching and release all watch handles.
    pub fn destroy(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.destroy();
        }
    }

    /// Convenience reload entry point, also used by hosts whose watch
    /// backend is external. Idempotent per source state.
    pub async fn reload(&self, kind: ReloadKind, rel_path: &str) -> Result<()> {
        self.root_packet().reload(kind, rel_path).await
    }

    /// Serve one asset id. `main` marks the request as the application
    /// entry: the loader is prepended and `porter.import(id)` appended.
    ///
    /// Returns `Ok(None)` when the id does not resolve, which the HTTP
    /// layer maps to `404` or hands to the next middleware.
    pub async fn read_asset(self: &Arc<Self>, path: &str, main: bool) -> Result<Option<Asset>> {
        let path = path.trim_start_matches('/');

        match path {
            "loader.js" => {
                let mut code = loader::LOADER_SOURCE.to_string();
                code.push_str(&format!(
                    "\nporter.configure({});\n",
                    serde_json::to_string(&self.loader_config())?
                ));
                return Ok(Some(Asset::new(
                    code.into_bytes(),
                    "application/javascript",
                    None,
                )));
            }
            "loaderConfig.json" => {
                let body = serde_json::to_vec_pretty(&self.loader_config())?;
                return Ok(Some(Asset::new(body, "application/json", None)));
            }
            "porter-sw.js" => {
                return Ok(Some(Asset::new(
                    loader::SERVICE_WORKER_SOURCE.as_bytes().to_vec(),
                    "application/javascript",
                    None,
                )));
            }
            _ => {}
        }

        if let Some(base) = path.strip_suffix(".map") {
            return self.read_map(base).await;
        }

        if let Some((packet, file)) = self.split_dependency_path(path).await? {
            return self.read_dependency_asset(&packet, &file).await;
        }

        if let Some(asset) = self.read_root_asset(path, main).await? {
            return Ok(Some(asset));
        }

        if self.config.source.serve {
            return self.read_raw_source(path).await;
        }
        Ok(None)
    }

    /// `<name>/<version>/<file>` addressing of a dependency packet.
    async fn split_dependency_path(&self, path: &str) -> Result<Option<(Arc<Packet>, String)>> {
        let segments: Vec<&str> = path.split('/').collect();
        let (name, version, file) = if segments.len() >= 4 && segments[0].starts_with('@') {
            (
                format!("{}/{}", segments[0], segments[1]),
                segments[2],
                segments[3..].join("/"),
            )
        } else if segments.len() >= 3 {
            (segments[0].to_string(), segments[1], segments[2..].join("/"))
        } else {
            return Ok(None);
        };
        if !looks_like_version(version) {
            return Ok(None);
        }

        let key = PacketKey::new(name.clone(), version.to_string());
        if let Some(packet) = self.packet(&key) {
            return Ok(Some((packet, file)));
        }
        // Direct URL before anything referenced the packet: walk
        // node_modules from the root.
        let root = self.root_packet();
        if let Some(packet) = root.dependency(&name).await? {
            if packet.version == version {
                return Ok(Some((packet, file)));
            }
        }
        Ok(None)
    }

    async fn read_dependency_asset(
        self: &Arc<Self>,
        packet: &Arc<Packet>,
        file: &str,
    ) -> Result<Option<Asset>> {
        let Some(module) = packet.parse_asset(file).await? else {
            return Ok(None);
        };
        let bundle = packet.bundle(&module.id, vec![module.id.clone()], format_of(&module.id));
        bundle.add_entry(&module.id);
        let output = bundle.obtain(BundleOptions::default()).await?;
        Ok(Some(Asset {
            content: output.code.clone().into_bytes(),
            content_type: content_type_for(&module.id),
            etag: output.etag.clone(),
            mtime: module.mtime(),
        }))
    }

    async fn read_root_asset(
        self: &Arc<Self>,
        path: &str,
        main: bool,
    ) -> Result<Option<Asset>> {
        let root = self.root_packet();
        let id = normalize_id(path);

        match kind_of(&id) {
            ModuleKind::Style => {
                // The stylesheet itself, or the CSS companion of a script
                // entry's graph.
                let entry_id = if root.file(&id).is_some() || root.parse_asset(&id).await?.is_some()
                {
                    id.clone()
                } else {
                    let companion = format!("{}.js", id.trim_end_matches(".css"));
                    if root.file(&companion).is_none()
                        && root.parse_asset(&companion).await?.is_none()
                    {
                        return Ok(None);
                    }
                    companion
                };
                let mtime = root.file(&entry_id).and_then(|module| module.mtime());
                let bundle = root.bundle(&id, vec![entry_id], BundleFormat::Css);
                let output = bundle.obtain(BundleOptions::default()).await?;
                Ok(Some(Asset {
                    content: output.code.clone().into_bytes(),
                    content_type: "text/css",
                    etag: output.etag.clone(),
                    mtime,
                }))
            }
            ModuleKind::Script => {
                let module = match root.file(&id) {
                    Some(module) => module,
                    None => match root.parse_asset(path).await? {
                        Some(module) => module,
                        None => return Ok(None),
                    },
                };
                // Every directly served root script is a root entry.
                module.update_state(|state| {
                    state.is_root_entry = true;
                });
                let bundle = root.bundle(&module.id, vec![module.id.clone()], BundleFormat::Js);
                let output = bundle
                    .obtain(BundleOptions {
                        loader: main,
                        minify: false,
                    })
                    .await?;
                Ok(Some(Asset {
                    content: output.code.clone().into_bytes(),
                    content_type: content_type_for(&module.id),
                    etag: output.etag.clone(),
                    mtime: module.mtime(),
                }))
            }
            ModuleKind::Isolated => Ok(None),
        }
    }

    /// `<artifact>.map` serves the map of the most recent rendering.
    async fn read_map(self: &Arc<Self>, base: &str) -> Result<Option<Asset>> {
        let bundle = if let Some((packet, file)) = self.split_dependency_path(base).await? {
            let id = normalize_id(&file);
            match packet.bundle_for(&id) {
                Some(bundle) => Some(bundle),
                None => {
                    // Render once so the map exists.
                    self.read_dependency_asset(&packet, &file).await?;
                    packet.bundle_for(&id)
                }
            }
        } else {
            let root = self.root_packet();
            let id = normalize_id(base);
            match root.bundle_for(&id) {
                Some(bundle) => Some(bundle),
                None => {
                    self.read_root_asset(base, false).await?;
                    root.bundle_for(&id)
                }
            }
        };
        let Some(bundle) = bundle else {
            return Ok(None);
        };
        let output = match bundle.last_output() {
            Some(output) => output,
            None => bundle.obtain(BundleOptions::default()).await?,
        };
        Ok(Some(Asset::new(
            output.map.to_json().into_bytes(),
            "application/json",
            None,
        )))
    }

    /// Raw source for devtools when `source.serve` is enabled. Only paths
    /// under the configured source roots or `node_modules` qualify.
    async fn read_raw_source(&self, path: &str) -> Result<Option<Asset>> {
        let allowed = path.starts_with("node_modules/")
            || self
                .config
                .paths
                .iter()
                .any(|root| path.starts_with(&format!("{root}/")));
        if !allowed || path.contains("..") {
            return Ok(None);
        }
        let fpath = self.root_dir.join(path);
        match tokio::fs::read(&fpath).await {
            Ok(content) => {
                let mtime = tokio::fs::metadata(&fpath)
                    .await
                    .ok()
                    .and_then(|meta| meta.modified().ok());
                Ok(Some(Asset::new(content, content_type_for(path), mtime)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Bundle format an id renders as.
fn format_of(id: &str) -> BundleFormat {
    match kind_of(id) {
        ModuleKind::Style => BundleFormat::Css,
        _ => BundleFormat::Js,
    }
}

/// `x.y.z`-shaped path segment.
fn looks_like_version(segment: &str) -> bool {
    let mut parts = segment.splitn(3, '.');
    let major = parts.next().unwrap_or("");
    !major.is_empty()
        && major.chars().all(|c| c.is_ascii_digit())
        && parts.next().is_some()
        && parts.next().is_some()
}

/// Content type by extension, mirroring what devtools expect.
fn content_type_for(path: &str) -> &'static str {
    match crate::module::extension_of(path) {
        Some("js") | Some("mjs") | Some("jsx") | Some("ts") | Some("tsx") => {
            "application/javascript"
        }
        Some("json") | Some("map") => "application/json",
        Some("css") | Some("less") => "text/css",
        Some("wasm") => "application/wasm",
        Some("html") => "text/html; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_segments() {
        assert!(looks_like_version("1.2.4"));
        assert!(looks_like_version("16.14.0"));
        assert!(looks_like_version("1.0.0-beta.1"));
        assert!(!looks_like_version("index.js"));
        assert!(!looks_like_version("lib"));
        assert!(!looks_like_version("v1.2.3"));
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("home.js"), "application/javascript");
        assert_eq!(content_type_for("app.css"), "text/css");
        assert_eq!(content_type_for("foo.json"), "application/json");
        assert_eq!(content_type_for("lib.wasm"), "application/wasm");
        assert_eq!(content_type_for("unknown.bin"), "application/octet-stream");
    }

    #[test]
    fn format_by_id() {
        assert_eq!(format_of("home.js"), BundleFormat::Js);
        assert_eq!(format_of("app.css"), BundleFormat::Css);
        assert_eq!(format_of("foo.json"), BundleFormat::Js);
    }
}
