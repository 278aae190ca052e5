//! Configuration-file watching for hot reload.
//!
//! Every role reloads on SIGHUP and on a change to its own config file;
//! this is the shared file-watch half of that contract.

use std::path::Path;

use notify::event::AccessKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum ReloadWatchError {
    #[error("cannot watch {path}: {source}")]
    Notify {
        path: String,
        source: notify::Error,
    },
    #[error("{0} has no parent directory to watch")]
    NoDirectory(String),
}

/// Keeps the underlying OS watch alive; drop to stop.
pub struct ConfigWatch {
    _watcher: RecommendedWatcher,
}

/// Watch `file`, emitting a unit on every write/create/move touching it.
pub fn watch_file(
    file: &Path,
    tx: mpsc::UnboundedSender<()>,
) -> Result<ConfigWatch, ReloadWatchError> {
    let dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .ok_or_else(|| ReloadWatchError::NoDirectory(file.display().to_string()))?;
    let target = file.to_path_buf();

    let handler = move |res: Result<Event, notify::Error>| {
        let Ok(event) = res else { return };
        let relevant = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Access(AccessKind::Close(_))
        );
        if relevant && event.paths.iter().any(|p| p == &target) {
            let _ = tx.send(());
        }
    };

    let mut watcher =
        RecommendedWatcher::new(handler, Config::default()).map_err(|e| ReloadWatchError::Notify {
            path: dir.display().to_string(),
            source: e,
        })?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| ReloadWatchError::Notify {
            path: dir.display().to_string(),
            source: e,
        })?;
    Ok(ConfigWatch { _watcher: watcher })
}
