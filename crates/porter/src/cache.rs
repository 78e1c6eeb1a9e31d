//! Content-addressed cache of transpilation outputs and bundle artifacts.
//!
//! Transpiled code and source maps are stored on disk under
//! `<dest>/.cache/<id>/<source_hash>`, so a changed source or changed
//! transpiler options miss naturally. All writes go through a temp file
//! plus rename, which keeps a concurrent writer on the same key safe: last
//! writer wins and readers never observe a torn file. Within one process,
//! concurrent transpilations of the same `(id, source_hash)` coalesce onto
//! a single in-flight computation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::sourcemap::SourceMap;
use crate::transpile::TranspileOutput;

/// Directory under `dest` holding per-module transpilation outputs.
const CACHE_DIR: &str = ".cache";

type InflightMap = Mutex<FxHashMap<String, Arc<OnceCell<Arc<TranspileOutput>>>>>;

/// Disk-backed cache rooted at the destination directory.
pub struct Cache {
    dest: PathBuf,
    inflight: InflightMap,
}

impl Cache {
    /// Create a cache rooted at `dest`, creating the directory as needed.
    pub fn new(dest: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dest).map_err(|source| Error::Cache {
            path: dest.clone(),
            source,
        })?;
        Ok(Self {
            dest,
            inflight: Mutex::new(FxHashMap::default()),
        })
    }

    /// Destination root this cache writes under.
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    fn entry_paths(&self, id: &str, source_hash: &str) -> (PathBuf, PathBuf) {
        let base = self.dest.join(CACHE_DIR).join(id);
        (
            base.join(format!("{source_hash}.code")),
            base.join(format!("{source_hash}.map")),
        )
    }

    /// Read a cached transpilation output, or `None` on miss.
    pub async fn read(&self, id: &str, source_hash: &str) -> Result<Option<TranspileOutput>> {
        let (code_path, map_path) = self.entry_paths(id, source_hash);
        let code = match tokio::fs::read_to_string(&code_path).await {
            Ok(code) => code,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(Error::Cache {
                    path: code_path,
                    source,
                })
            }
        };
        let map = match tokio::fs::read_to_string(&map_path).await {
            Ok(json) => SourceMap::from_json(&json).ok(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(Error::Cache {
                    path: map_path,
                    source,
                })
            }
        };
        Ok(Some(TranspileOutput { code, map }))
    }

    /// Store a transpilation output. Atomic, last writer wins. The map is
    /// stored with `sourcesContent` stripped to bound disk use.
    pub async fn write(
        &self,
        id: &str,
        source_hash: &str,
        code: &str,
        map: Option<&SourceMap>,
    ) -> Result<()> {
        let (code_path, map_path) = self.entry_paths(id, source_hash);
        atomic_write(&code_path, code.as_bytes().to_vec()).await?;
        if let Some(map) = map {
            let mut stripped = map.clone();
            stripped.strip_sources_content();
            atomic_write(&map_path, stripped.to_json().into_bytes()).await?;
        }
        Ok(())
    }

    /// Write a raw artifact under the destination root.
    pub async fn write_file(&self, rel_path: &str, bytes: Vec<u8>) -> Result<()> {
        atomic_write(&self.dest.join(rel_path), bytes).await
    }

    /// Clear the destination directory except for top-level entries named
    /// in `keep`.
    pub async fn remove_all(&self, keep: &[String]) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.dest).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(Error::Cache {
                    path: self.dest.clone(),
                    source,
                })
            }
        };
        while let Some(entry) = entries.next_entry().await.map_err(|source| Error::Cache {
            path: self.dest.clone(),
            source,
        })? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.iter().any(|kept| kept == &name) {
                continue;
            }
            let path = entry.path();
            let result = if entry.path().is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(source) = result {
                return Err(Error::Cache { path, source });
            }
        }
        Ok(())
    }

    /// Transpile-through-cache with single-flight coalescing: for a given
    /// `(id, source_hash)` at most one transpile runs; concurrent callers
    /// await and share its result.
    pub async fn transpile_cached<F, Fut>(
        &self,
        id: &str,
        source_hash: &str,
        transpile: F,
    ) -> Result<Arc<TranspileOutput>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<TranspileOutput>>,
    {
        let key = format!("{id}\u{0}{source_hash}");
        let cell = {
            let mut inflight = self.inflight.lock();
            Arc::clone(inflight.entry(key).or_default())
        };
        let output = cell
            .get_or_try_init(|| async {
                if let Some(hit) = self.read(id, source_hash).await? {
                    return Ok::<_, Error>(Arc::new(hit));
                }
                let fresh = transpile().await?;
                self.write(id, source_hash, &fresh.code, fresh.map.as_ref())
                    .await?;
                Ok(Arc::new(fresh))
            })
            .await?;
        Ok(Arc::clone(output))
    }
}

/// Digest of a raw source combined with the transpiler fingerprint. Keys
/// every cache entry.
pub fn source_hash(source: &str, fingerprint: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(b"\0");
    hasher.update(fingerprint.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// then rename over the target.
async fn atomic_write(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let parent = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(|source| Error::Cache {
            path: parent.to_path_buf(),
            source,
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|source| Error::Cache {
            path: path.clone(),
            source,
        })?;
        use std::io::Write;
        tmp.write_all(&bytes).map_err(|source| Error::Cache {
            path: path.clone(),
            source,
        })?;
        tmp.persist(&path).map_err(|err| Error::Cache {
            path: path.clone(),
            source: err.error,
        })?;
        Ok(())
    })
    .await
    .map_err(|err| Error::Config(format!("cache writer task failed: {err}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn test_cache() -> (Cache, TempDir) {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path().join("public")).unwrap();
        (cache, dir)
    }

    #[tokio::test]
    async fn read_misses_before_write() {
        let (cache, _dir) = test_cache();
        assert!(cache.read("home.js", "abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_read_round_trip_is_byte_identical() {
        let (cache, _dir) = test_cache();
        let code = "var a = 1;\nvar b = 2;\n";
        cache.write("home.js", "abc", code, None).await.unwrap();
        let hit = cache.read("home.js", "abc").await.unwrap().unwrap();
        assert_eq!(hit.code, code);
        assert!(hit.map.is_none());
    }

    #[tokio::test]
    async fn map_is_stored_with_sources_content_stripped() {
        let (cache, _dir) = test_cache();
        let map = SourceMap {
            version: 3,
            sources: vec!["home.js".to_string()],
            sources_content: vec![Some("var a = 1;".to_string())],
            ..SourceMap::default()
        };
        cache.write("home.js", "abc", "code", Some(&map)).await.unwrap();
        let hit = cache.read("home.js", "abc").await.unwrap().unwrap();
        let stored = hit.map.unwrap();
        assert_eq!(stored.sources, map.sources);
        assert!(stored.sources_content.is_empty());
    }

    #[tokio::test]
    async fn different_hash_is_a_different_entry() {
        let (cache, _dir) = test_cache();
        cache.write("home.js", "aaa", "old", None).await.unwrap();
        cache.write("home.js", "bbb", "new", None).await.unwrap();
        assert_eq!(cache.read("home.js", "aaa").await.unwrap().unwrap().code, "old");
        assert_eq!(cache.read("home.js", "bbb").await.unwrap().unwrap().code, "new");
    }

    #[tokio::test]
    async fn concurrent_transpiles_coalesce() {
        let (cache, _dir) = test_cache();
        let cache = Arc::new(cache);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .transpile_cached("home.js", "abc", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(TranspileOutput {
                            code: "transpiled".to_string(),
                            map: None,
                        })
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().code, "transpiled");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transpile_cached_reads_disk_first() {
        let (cache, _dir) = test_cache();
        cache.write("home.js", "abc", "from disk", None).await.unwrap();
        let output = cache
            .transpile_cached("home.js", "abc", || async {
                panic!("must not transpile on a disk hit");
            })
            .await
            .unwrap();
        assert_eq!(output.code, "from disk");
    }

    #[tokio::test]
    async fn remove_all_honors_keep_set() {
        let (cache, _dir) = test_cache();
        cache.write_file("app.js", b"a".to_vec()).await.unwrap();
        cache
            .write_file("react/16.0.0/index.js", b"b".to_vec())
            .await
            .unwrap();
        cache.remove_all(&["react".to_string()]).await.unwrap();

        assert!(!cache.dest().join("app.js").exists());
        assert!(cache.dest().join("react/16.0.0/index.js").exists());
    }

    #[test]
    fn source_hash_depends_on_fingerprint() {
        let a = source_hash("var a = 1;", "babel");
        let b = source_hash("var a = 1;", "typescript");
        let c = source_hash("var a = 2;", "babel");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, source_hash("var a = 1;", "babel"));
    }
}
