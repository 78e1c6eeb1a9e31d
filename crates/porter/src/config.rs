//! Application configuration.
//!
//! Configuration is a plain serde structure loadable from a
//! `porter.config.json` at the project root, with every field optional and
//! defaulted. Programmatic construction works the same way: build an
//! [`AppConfig`] with struct update syntax and hand it to `App::new`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the optional config file looked up at the project root.
pub const CONFIG_FILE: &str = "porter.config.json";

/// Top-level configuration for an [`crate::App`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    /// Project directory. Defaults to the current working directory.
    pub root: Option<PathBuf>,

    /// Ordered list of source roots within `root`.
    pub paths: Vec<String>,

    /// Cache and published artifact directory, relative to `root`.
    pub dest: String,

    /// Explicit entry module list. When empty, every `.js` file directly
    /// under the first source root is treated as an entry.
    pub entries: Vec<String>,

    /// Ordered list of preload entries. Their closure is bundled once and
    /// listed in the loader config so clients fetch it before any entry.
    pub preload: Vec<String>,

    /// Bundle scoping options.
    pub bundle: BundleSection,

    /// Transpilation options.
    pub transpile: TranspileSection,

    /// Resolution options.
    pub resolve: ResolveSection,

    /// Raw source exposure for devtools.
    pub source: SourceSection,

    /// Cache retention options.
    pub cache: CacheSection,
}

/// `bundle.*` options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BundleSection {
    /// Packet names whose contents must not be inlined into root bundles.
    /// Excluded packets are delivered as their own artifacts instead.
    pub exclude: Vec<String>,
}

/// `transpile.*` options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TranspileSection {
    /// Dependency packet names that should be transpiled despite being
    /// external. The root packet is always eligible.
    pub include: Vec<String>,
}

/// `resolve.*` options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolveSection {
    /// Prefix rewrite table applied before bare-specifier resolution.
    /// Ordered map so longest-prefix matching stays deterministic.
    pub alias: BTreeMap<String, String>,
}

/// `source.*` options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceSection {
    /// Expose raw sources under the source roots and `node_modules` for
    /// devtools.
    pub serve: bool,

    /// Public URL prefix for source-map source paths.
    pub root: Option<String>,
}

/// `cache.*` options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheSection {
    /// Ids excluded from the startup cache purge.
    pub except: Vec<String>,

    /// Keep the cache across restarts instead of purging at startup.
    pub persist: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root: None,
            paths: vec!["components".to_string()],
            dest: "public".to_string(),
            entries: Vec::new(),
            preload: Vec::new(),
            bundle: BundleSection::default(),
            transpile: TranspileSection::default(),
            resolve: ResolveSection::default(),
            source: SourceSection::default(),
            cache: CacheSection::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `<root>/porter.config.json`, falling back to
    /// defaults when the file is absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<AppConfig>(&text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(err) => return Err(err.into()),
        };
        config.root = Some(root.to_path_buf());
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(Error::Config(
                "at least one source root is required in 'paths'".to_string(),
            ));
        }
        for path in &self.paths {
            if Path::new(path).is_absolute() || path.contains("..") {
                return Err(Error::Config(format!(
                    "source root '{path}' must be a plain relative path"
                )));
            }
        }
        if self.dest.is_empty() {
            return Err(Error::Config("'dest' must not be empty".to_string()));
        }
        Ok(())
    }

    /// Absolute project root, defaulting to the current working directory.
    pub fn resolved_root(&self) -> PathBuf {
        match &self.root {
            Some(root) => root.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Absolute destination directory.
    pub fn resolved_dest(&self) -> PathBuf {
        self.resolved_root().join(&self.dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_convention() {
        let config = AppConfig::default();
        assert_eq!(config.paths, vec!["components".to_string()]);
        assert_eq!(config.dest, "public");
        assert!(!config.source.serve);
        assert!(!config.cache.persist);
    }

    #[test]
    fn parses_camel_case_sections() {
        let json = r#"{
            "paths": ["components", "browser_modules"],
            "dest": "dist",
            "preload": ["preload.js"],
            "bundle": { "exclude": ["react"] },
            "transpile": { "include": ["yen"] },
            "resolve": { "alias": { "@/": "components/" } },
            "source": { "serve": true, "root": "http://localhost:3000/" },
            "cache": { "except": ["react"], "persist": true }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.paths.len(), 2);
        assert_eq!(config.bundle.exclude, vec!["react".to_string()]);
        assert_eq!(config.transpile.include, vec!["yen".to_string()]);
        assert_eq!(
            config.resolve.alias.get("@/"),
            Some(&"components/".to_string())
        );
        assert!(config.source.serve);
        assert!(config.cache.persist);
    }

    #[test]
    fn rejects_empty_paths() {
        let config = AppConfig {
            paths: Vec::new(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_traversing_source_root() {
        let config = AppConfig {
            paths: vec!["../outside".to_string()],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(dir.path()).unwrap();
        assert_eq!(config.dest, "public");
        assert_eq!(config.root.as_deref(), Some(dir.path()));
    }
}
