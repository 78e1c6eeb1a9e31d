//! Error types for the asset pipeline.
//!
//! One top-level [`Error`] enum covers the whole crate. Recoverable
//! conditions (an unresolvable specifier while parsing, a missing CSS
//! companion) never surface here; they degrade to placeholder modules or
//! empty bundles and are logged instead.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// A specifier could not be mapped to a file and no placeholder was
    /// allowed (e.g. an explicit entry that does not exist).
    #[error("unable to resolve '{specifier}' from {}", .importer.display())]
    Resolve {
        /// The specifier that failed to resolve
        specifier: String,
        /// The file or directory the resolution started from
        importer: PathBuf,
    },

    /// The transpiler rejected a source file.
    #[error("transpile error in {}: {diagnostic}", .file.display())]
    Transpile {
        /// File that failed to transpile
        file: PathBuf,
        /// Diagnostic reported by the transpiler backend
        diagnostic: String,
    },

    /// Persistent I/O failure on the cache directory.
    #[error("cache error at {}: {source}", .path.display())]
    Cache {
        /// Offending path under the cache destination
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An entry referenced at bundle time is absent from the packet.
    #[error("bundle entry '{entry}' is not parsed in packet {packet}")]
    Bundle {
        /// The missing entry id
        entry: String,
        /// `name@version` of the owning packet
        packet: String,
    },

    /// The watcher backend failed. Surfaced as a warning by callers and
    /// downgraded to "hot reload disabled".
    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// Invalid or contradictory configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors outside the cache directory.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON in a manifest, lock file or source map.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
