//! Shared fixtures for integration tests.
//!
//! Builds throwaway projects under a temp directory: a root package with
//! source roots, plus dependency packets under `node_modules`.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use porter::{App, AppConfig};
use tempfile::TempDir;

pub struct TestProject {
    pub dir: TempDir,
}

impl TestProject {
    /// A project named `demo` with an empty `components` source root.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{ "name": "demo", "version": "1.0.0" }"#,
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("components")).unwrap();
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file relative to the project root.
    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    /// Install a dependency packet under `node_modules`.
    pub fn packet(&self, name: &str, version: &str, files: &[(&str, &str)]) {
        self.packet_at(&format!("node_modules/{name}"), name, version, files);
    }

    /// Install a packet at an explicit directory, for nested
    /// `node_modules` trees holding a second version.
    pub fn packet_at(&self, dir: &str, name: &str, version: &str, files: &[(&str, &str)]) {
        self.write(
            &format!("{dir}/package.json"),
            &format!(r#"{{ "name": "{name}", "version": "{version}", "main": "index.js" }}"#),
        );
        for (rel, content) in files {
            self.write(&format!("{dir}/{rel}"), content);
        }
    }

    pub fn config(&self) -> AppConfig {
        AppConfig {
            root: Some(self.root().to_path_buf()),
            ..AppConfig::default()
        }
    }

    pub async fn app(&self) -> Arc<App> {
        App::new(self.config()).await.unwrap()
    }

    pub async fn app_with(&self, tweak: impl FnOnce(&mut AppConfig)) -> Arc<App> {
        let mut config = self.config();
        tweak(&mut config);
        App::new(config).await.unwrap()
    }
}

/// Body of an asset as UTF-8.
pub async fn body(app: &Arc<App>, path: &str, main: bool) -> String {
    let asset = app
        .read_asset(path, main)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("asset {path} should resolve"));
    String::from_utf8(asset.content).unwrap()
}

/// Count occurrences of a needle in a haystack.
pub fn count(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}
