//! Filesystem watching for hot reload.
//!
//! Watches the root packet's source roots recursively and forwards change
//! events into [`crate::Packet::reload`]. Rapid successive events for the
//! same path are collapsed here; the per-bundle 100 ms debounce downstream
//! collapses the rest. Watch backend failures degrade to a warning and
//! disable hot reload rather than failing the app.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::app::App;
use crate::error::Result;

/// Same-path events inside this window are dropped at the watcher level.
const PATH_DEBOUNCE: Duration = Duration::from_millis(50);

/// Kind of filesystem change handed to `Packet::reload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadKind {
    Change,
    Create,
    Remove,
}

impl ReloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadKind::Change => "change",
            ReloadKind::Create => "create",
            ReloadKind::Remove => "remove",
        }
    }
}

/// Recursive watcher over the root packet's source roots.
pub struct Watcher {
    _watcher: RecommendedWatcher,
    forward: tokio::task::JoinHandle<()>,
}

impl Watcher {
    /// Start watching. Events are forwarded to the root packet on the
    /// current tokio runtime.
    pub fn new(app: Arc<App>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<(ReloadKind, PathBuf)>(256);
        let mut last_event: Option<(PathBuf, Instant)> = None;

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let Ok(event) = result else {
                return;
            };
            let kind = match event.kind {
                EventKind::Create(_) => ReloadKind::Create,
                EventKind::Modify(_) => ReloadKind::Change,
                EventKind::Remove(_) => ReloadKind::Remove,
                _ => return,
            };
            for path in event.paths {
                if should_ignore(&path) {
                    continue;
                }
                let now = Instant::now();
                if let Some((last_path, last_time)) = &last_event {
                    if *last_path == path && now.duration_since(*last_time) < PATH_DEBOUNCE {
                        continue;
                    }
                }
                last_event = Some((path.clone(), now));
                let _ = tx.blocking_send((kind, path));
            }
        })?;

        let root = app.root_packet();
        for path in &root.paths {
            if path.exists() {
                watcher.watch(path, RecursiveMode::Recursive)?;
            }
        }

        let forward = tokio::spawn(forward_events(app, rx));
        Ok(Self {
            _watcher: watcher,
            forward,
        })
    }

    /// Release watch handles and stop forwarding. Pending per-bundle
    /// debounce timers cancel themselves once superseded.
    pub fn destroy(self) {
        self.forward.abort();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.forward.abort();
    }
}

async fn forward_events(app: Arc<App>, mut rx: mpsc::Receiver<(ReloadKind, PathBuf)>) {
    while let Some((kind, path)) = rx.recv().await {
        let Ok(rel) = path.strip_prefix(app.root_dir()) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        debug!("fs event {} {rel}", kind.as_str());
        let root = app.root_packet();
        if let Err(err) = root.reload(kind, &rel).await {
            warn!("reload of {rel} failed: {err}");
        }
    }
}

/// Hidden files, editor droppings and build output are not interesting.
fn should_ignore(path: &Path) -> bool {
    for component in path.components() {
        if let Some(name) = component.as_os_str().to_str() {
            if name == "node_modules" {
                return true;
            }
            if name.starts_with('.') && name != "." && name != ".." {
                return true;
            }
            if name.ends_with('~') || name.ends_with(".swp") {
                return true;
            }
        }
    }
    false
}
