//! # porter
//!
//! Server-integrated asset pipeline for browser applications.
//!
//! Porter resolves a project's source tree and its third-party dependency
//! tree into a forest of packets, each owning a graph of modules. Modules
//! are transpiled and cached individually; bundles are rendered on demand
//! by a deterministic traversal that honors preload, scope and isolation
//! rules, and carry a merged source map and a content hash. A filesystem
//! watcher invalidates modules and bundles with debounced rebuilds.
//!
//! ## Quick start
//!
//! ```no_run
//! use porter::{App, AppConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> porter::Result<()> {
//! let config = AppConfig {
//!     root: Some("./demo-app".into()),
//!     preload: vec!["preload.js".to_string()],
//!     ..AppConfig::default()
//! };
//! let app = App::new(config).await?;
//! app.watch();
//!
//! // Serve the application entry with the loader attached.
//! if let Some(asset) = app.read_asset("home.js", true).await? {
//!     assert!(asset.content_type.starts_with("application/javascript"));
//! }
//! # Ok(()) }
//! ```

pub mod app;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod error;
pub mod loader;
pub mod matcher;
pub mod module;
pub mod packet;
pub mod resolver;
pub mod sourcemap;
pub mod transpile;
pub mod watcher;

pub use app::{App, Asset};
pub use bundle::{Bundle, BundleFormat, BundleOptions, BundleOutput, BundleScope};
pub use cache::Cache;
pub use config::AppConfig;
pub use error::{Error, Result};
pub use module::{Module, ModuleKey, ModuleKind};
pub use packet::{Packet, PacketKey};
pub use sourcemap::{SourceMap, SourceMapBuilder};
pub use transpile::{
    TranspileContext, TranspileOutput, Transpiler, TranspilerKind, TranspilerRegistry,
};
pub use watcher::{ReloadKind, Watcher};
