//! Specifier-to-file resolution.
//!
//! This module owns the path-level half of resolution: probing a candidate
//! path under a packet directory with the extension and directory-index
//! rules, applying alias rewrites and `browser` field overrides. The
//! packet-level half (walking `node_modules` upward to find the packet a
//! bare specifier names) lives in [`crate::packet`], which calls into here
//! once it knows the base directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use path_clean::PathClean;
use tracing::warn;

use crate::module::{SCRIPT_EXTENSIONS, STYLE_EXTENSIONS};

/// Whether a specifier is being resolved from script or style context;
/// decides which extension list the probes use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveContext {
    Script,
    Style,
}

impl ResolveContext {
    fn extensions(&self) -> &'static [&'static str] {
        match self {
            ResolveContext::Script => SCRIPT_EXTENSIONS,
            ResolveContext::Style => STYLE_EXTENSIONS,
        }
    }
}

/// A successfully probed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Absolute path of the file on disk
    pub fpath: PathBuf,
    /// Path relative to the probed base directory, `/`-separated
    pub rel: String,
    /// The candidate was a directory and resolved through its index file
    pub via_index: bool,
}

/// `browser` field override for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserOverride {
    /// `false`: the target is disabled and becomes an empty placeholder.
    Disabled,
    /// A replacement path within the same packet.
    Redirect(String),
}

/// Join and normalize a relative specifier against the directory of the
/// referring module. Returns a packet-relative `/`-separated path, or
/// `None` when the specifier escapes the packet.
pub fn join_relative(from_dir: &str, spec: &str) -> Option<String> {
    let joined = if from_dir.is_empty() {
        PathBuf::from(spec)
    } else {
        Path::new(from_dir).join(spec)
    };
    let cleaned = joined.clean();
    let rel = to_slash(&cleaned);
    if rel.starts_with("..") {
        return None;
    }
    Some(rel)
}

/// Rewrite a specifier through the alias table. Longest prefix wins so a
/// `@/` alias never shadows a more specific `@/lib/` one.
pub fn apply_alias(alias: &BTreeMap<String, String>, spec: &str) -> Option<String> {
    let mut best: Option<(&str, &str)> = None;
    for (prefix, replacement) in alias {
        if spec.starts_with(prefix.as_str()) {
            match best {
                Some((current, _)) if current.len() >= prefix.len() => {}
                _ => best = Some((prefix, replacement)),
            }
        }
    }
    best.map(|(prefix, replacement)| format!("{replacement}{}", &spec[prefix.len()..]))
}

/// Probe `rel` under `base` with the extension and directory-index rules.
///
/// Order: the exact candidate first, then each context extension appended,
/// then `rel/index.<ext>` for directories. First match wins.
pub async fn probe(base: &Path, rel: &str, context: ResolveContext) -> Option<Resolution> {
    let candidate = base.join(rel);

    if is_file(&candidate).await {
        verify_case(base, rel).await;
        return Some(Resolution {
            fpath: candidate,
            rel: rel.to_string(),
            via_index: false,
        });
    }

    // An extensionless candidate probes the context extensions. A
    // candidate already carrying the canonical `.js` / `.css` suffix
    // re-probes its stem, so the public id `home.js` finds an on-disk
    // `home.ts`.
    let stem = match crate::module::extension_of(rel) {
        None => Some(rel.to_string()),
        Some("js") => rel.strip_suffix(".js").map(str::to_string),
        Some("css") => rel.strip_suffix(".css").map(str::to_string),
        Some(_) => None,
    };
    if let Some(stem) = stem {
        for ext in context.extensions() {
            let with_ext = format!("{stem}.{ext}");
            if with_ext == rel {
                continue;
            }
            let fpath = base.join(&with_ext);
            if is_file(&fpath).await {
                verify_case(base, &with_ext).await;
                return Some(Resolution {
                    fpath,
                    rel: with_ext,
                    via_index: false,
                });
            }
        }
    }

    if is_dir(&candidate).await {
        for ext in context.extensions() {
            let index = format!("{rel}/index.{ext}");
            let fpath = base.join(&index);
            if is_file(&fpath).await {
                verify_case(base, &index).await;
                return Some(Resolution {
                    fpath,
                    rel: index,
                    via_index: true,
                });
            }
        }
    }

    None
}

/// Apply a packet's `browser` overrides to a packet-relative target.
///
/// Keys are matched both bare and `./`-prefixed, with and without the
/// `.js` extension, mirroring how manifests in the wild write them.
pub fn browser_override(
    browser: &BTreeMap<String, BrowserOverride>,
    rel: &str,
) -> Option<BrowserOverride> {
    let bare = rel.trim_start_matches("./");
    let mut candidates = vec![format!("./{bare}"), bare.to_string()];
    if let Some(stripped) = bare.strip_suffix(".js") {
        candidates.push(format!("./{stripped}"));
        candidates.push(stripped.to_string());
    }
    for key in candidates {
        if let Some(found) = browser.get(&key) {
            return Some(found.clone());
        }
    }
    None
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// On case-insensitive filesystems a probe can succeed although the on-disk
/// name differs in case; that breaks once the project hits a case-sensitive
/// machine. Warn, but let the resolution stand.
async fn verify_case(base: &Path, rel: &str) {
    let path = base.join(rel);
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return;
    };
    let Some(expected) = name.to_str() else {
        return;
    };
    let Ok(mut entries) = tokio::fs::read_dir(parent).await else {
        return;
    };
    let mut case_insensitive_hit = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let actual = entry.file_name();
        if actual.as_os_str() == name {
            return;
        }
        if let Some(actual) = actual.to_str() {
            if actual.eq_ignore_ascii_case(expected) {
                case_insensitive_hit = Some(actual.to_string());
            }
        }
    }
    if let Some(actual) = case_insensitive_hit {
        warn!(
            "case mismatch resolving '{rel}': on-disk name is '{actual}'; \
             this will fail on case-sensitive filesystems"
        );
    }
}

fn to_slash(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

/// Split a bare specifier into its package name and optional subpath.
/// Scoped names (`@org/pkg/sub`) keep both segments in the name.
pub fn split_bare(spec: &str) -> (&str, Option<&str>) {
    if let Some(rest) = spec.strip_prefix('@') {
        if let Some(slash) = rest.find('/') {
            let after_scope = &rest[slash + 1..];
            match after_scope.find('/') {
                Some(second) => {
                    let name_len = 1 + slash + 1 + second;
                    (&spec[..name_len], Some(&spec[name_len + 1..]))
                }
                None => (spec, None),
            }
        } else {
            (spec, None)
        }
    } else {
        match spec.find('/') {
            Some(slash) => (&spec[..slash], Some(&spec[slash + 1..])),
            None => (spec, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn join_relative_collapses_dots() {
        assert_eq!(
            join_relative("components/nested", "../home.js").as_deref(),
            Some("components/home.js")
        );
        assert_eq!(
            join_relative("", "./home.js").as_deref(),
            Some("home.js")
        );
        assert_eq!(join_relative("a", "../../escape.js"), None);
    }

    #[test]
    fn alias_longest_prefix_wins() {
        let mut alias = BTreeMap::new();
        alias.insert("@/".to_string(), "components/".to_string());
        alias.insert("@/lib/".to_string(), "vendor/lib/".to_string());
        assert_eq!(
            apply_alias(&alias, "@/home.js").as_deref(),
            Some("components/home.js")
        );
        assert_eq!(
            apply_alias(&alias, "@/lib/util.js").as_deref(),
            Some("vendor/lib/util.js")
        );
        assert_eq!(apply_alias(&alias, "react"), None);
    }

    #[tokio::test]
    async fn probe_exact_match_first() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "home.js", "");
        write(dir.path(), "home.js.js", "");
        let found = probe(dir.path(), "home.js", ResolveContext::Script)
            .await
            .unwrap();
        assert_eq!(found.rel, "home.js");
        assert!(!found.via_index);
    }

    #[tokio::test]
    async fn probe_extension_order() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mod.ts", "");
        write(dir.path(), "mod.json", "");
        let found = probe(dir.path(), "mod", ResolveContext::Script)
            .await
            .unwrap();
        // `.js` then `.jsx` miss, `.ts` hits before `.json`.
        assert_eq!(found.rel, "mod.ts");
    }

    #[tokio::test]
    async fn probe_directory_index() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "widget/index.jsx", "");
        let found = probe(dir.path(), "widget", ResolveContext::Script)
            .await
            .unwrap();
        assert_eq!(found.rel, "widget/index.jsx");
        assert!(found.via_index);
    }

    #[tokio::test]
    async fn probe_style_context_uses_style_extensions() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "app.less", "");
        let found = probe(dir.path(), "app", ResolveContext::Style)
            .await
            .unwrap();
        assert_eq!(found.rel, "app.less");
        assert!(
            probe(dir.path(), "app", ResolveContext::Script).await.is_none(),
            "style files must not satisfy script probes"
        );
    }

    #[tokio::test]
    async fn probe_missing_yields_none() {
        let dir = TempDir::new().unwrap();
        assert!(probe(dir.path(), "ghost", ResolveContext::Script).await.is_none());
    }

    #[test]
    fn browser_override_matches_key_variants() {
        let mut browser = BTreeMap::new();
        browser.insert("./ws".to_string(), BrowserOverride::Disabled);
        browser.insert(
            "./node-stream.js".to_string(),
            BrowserOverride::Redirect("./web-stream.js".to_string()),
        );
        assert_eq!(
            browser_override(&browser, "ws.js"),
            Some(BrowserOverride::Disabled)
        );
        assert_eq!(
            browser_override(&browser, "./node-stream.js"),
            Some(BrowserOverride::Redirect("./web-stream.js".to_string()))
        );
        assert_eq!(browser_override(&browser, "other.js"), None);
    }

    #[test]
    fn split_bare_handles_scopes() {
        assert_eq!(split_bare("react"), ("react", None));
        assert_eq!(split_bare("yen/events"), ("yen", Some("events")));
        assert_eq!(split_bare("@cara/hen"), ("@cara/hen", None));
        assert_eq!(
            split_bare("@cara/hen/lib/index.js"),
            ("@cara/hen", Some("lib/index.js"))
        );
    }
}
