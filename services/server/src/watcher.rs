//! Filesystem watching for origin patterns.
//!
//! Two backends: kernel notifications (the default) and a polling observer
//! for filesystems where inotify is useless (NFS mounts). Both feed accepted
//! paths into a channel owned by the chain.
//!
//! A path is accepted when the kernel reports it complete (close-after-write,
//! moved in, or a second hard link appearing), its full path matches the
//! origin glob, and it is non-empty; a zero-byte file is assumed still in
//! flight.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ferry_util::{fnmatch, Pattern};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WatchBackend {
    Kernel,
    Polling { interval: Duration },
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("cannot watch {path}: {source}")]
    Notify {
        path: String,
        source: notify::Error,
    },
    #[error("pattern {0} has no watchable directory")]
    NoDirectory(String),
}

/// Keeps the underlying OS watcher alive; dropping it stops the watch.
pub struct FsWatcher {
    _inner: WatcherKind,
}

enum WatcherKind {
    Kernel(RecommendedWatcher),
    Polling(PollWatcher),
}

// ---------------------------------------------------------------------------
// Origin watching
// ---------------------------------------------------------------------------

/// Watch the directory of `pattern`, sending accepted paths to `tx`.
pub fn watch_pattern(
    pattern: &Pattern,
    backend: WatchBackend,
    tx: mpsc::UnboundedSender<PathBuf>,
) -> Result<FsWatcher, WatchError> {
    let glob = pattern.globify();
    let (watch_dir, recursive) = watch_root(&glob)
        .ok_or_else(|| WatchError::NoDirectory(pattern.source().to_owned()))?;

    debug!(dir = %watch_dir.display(), recursive, glob = %glob, "watching origin");

    let handler = move |res: Result<Event, notify::Error>| {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "watch error");
                return;
            }
        };
        let polling = matches!(backend, WatchBackend::Polling { .. });
        if !event_completes_file(&event.kind, polling) {
            return;
        }
        // Plain creations only count once a second hard link appears;
        // freshly written files are caught at close-after-write instead.
        let link_only = !polling && matches!(event.kind, EventKind::Create(_));
        for path in event.paths {
            if link_only && !is_extra_link(&path) {
                continue;
            }
            if !accepts(&glob, &path) {
                continue;
            }
            if tx.send(path).is_err() {
                return;
            }
        }
    };

    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };

    let inner = match backend {
        WatchBackend::Kernel => {
            let mut watcher = RecommendedWatcher::new(handler, Config::default())
                .map_err(|e| notify_err(&watch_dir, e))?;
            watcher
                .watch(&watch_dir, mode)
                .map_err(|e| notify_err(&watch_dir, e))?;
            WatcherKind::Kernel(watcher)
        }
        WatchBackend::Polling { interval } => {
            let mut watcher =
                PollWatcher::new(handler, Config::default().with_poll_interval(interval))
                    .map_err(|e| notify_err(&watch_dir, e))?;
            watcher
                .watch(&watch_dir, mode)
                .map_err(|e| notify_err(&watch_dir, e))?;
            WatcherKind::Polling(watcher)
        }
    };

    Ok(FsWatcher { _inner: inner })
}

/// Full-path glob match plus the zero-byte suppression.
pub fn accepts(glob: &str, path: &Path) -> bool {
    let Some(text) = path.to_str() else {
        return false;
    };
    if !fnmatch(glob, text) {
        debug!(path = %path.display(), "no pattern match");
        return false;
    }
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => {
            debug!(path = %path.display(), "ignoring empty file");
            false
        }
        Ok(_) => true,
        Err(_) => false,
    }
}

fn event_completes_file(kind: &EventKind, polling: bool) -> bool {
    if polling {
        // The poll backend only diffs mtimes and sizes; take everything it
        // reports and let the glob/size gate decide.
        return matches!(kind, EventKind::Create(_) | EventKind::Modify(_));
    }
    matches!(
        kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
            | EventKind::Create(_)
    )
}

#[cfg(unix)]
fn is_extra_link(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).map(|m| m.nlink() > 1).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_extra_link(_path: &Path) -> bool {
    false
}

/// The deepest literal directory of a glob, and whether anything below it
/// needs a recursive watch.
fn watch_root(glob: &str) -> Option<(PathBuf, bool)> {
    let path = Path::new(glob);
    let mut root = PathBuf::new();
    let mut wild_levels = 0;
    let mut seen_wild = false;
    for component in path.components() {
        let text = component.as_os_str().to_string_lossy();
        let is_wild = text.contains(['*', '?', '[']);
        if seen_wild || is_wild {
            seen_wild = true;
            wild_levels += 1;
        } else {
            root.push(component);
        }
    }
    if root.as_os_str().is_empty() {
        return None;
    }
    // The last wild component is the filename itself.
    Some((root, wild_levels > 1))
}

fn notify_err(path: &Path, source: notify::Error) -> WatchError {
    WatchError::Notify {
        path: path.display().to_string(),
        source,
    }
}
