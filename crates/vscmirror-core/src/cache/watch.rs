//! Filesystem change notifications for the metadata cache.

use crate::cache::CacheError;
use crate::paths::StoreLayout;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Watch the store and signal `tx` on relevant changes.
///
/// The extension and custom trees are watched recursively, the store root
/// only for its own files (malicious list, recommendations). Signals are
/// sent with `try_send` on a bounded channel, so a burst of events while the
/// consumer is busy collapses into one pending signal.
///
/// # Errors
///
/// [`CacheError::Watch`] if the platform watcher cannot be created or a
/// directory cannot be watched.
pub fn watch_store(
    layout: &StoreLayout,
    cache_dir: &Path,
    tx: mpsc::Sender<()>,
) -> Result<RecommendedWatcher, CacheError> {
    let ignore = cache_dir.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) if is_relevant(&event, &ignore) => {
                let _ = tx.try_send(());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Store watcher error"),
        },
        notify::Config::default(),
    )?;

    let targets: [(PathBuf, RecursiveMode); 3] = [
        (layout.root().to_path_buf(), RecursiveMode::NonRecursive),
        (layout.extensions(), RecursiveMode::Recursive),
        (layout.custom_extensions().to_path_buf(), RecursiveMode::Recursive),
    ];
    for (path, mode) in targets {
        if path.is_dir() {
            watcher.watch(&path, mode)?;
            tracing::debug!(path = %path.display(), ?mode, "Watching");
        } else {
            tracing::debug!(path = %path.display(), "Not watching missing directory");
        }
    }
    Ok(watcher)
}

/// Whether an event can change what a snapshot would contain.
///
/// Temporary files (dot-prefixed, `.part`) and anything under the cache
/// directory are ignored; the snapshot file itself lives there.
pub fn is_relevant(event: &Event, cache_dir: &Path) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    event.paths.iter().any(|p| {
        let hidden = p
            .file_name()
            .and_then(|n| n.to_str())
            .is_none_or(|n| n.starts_with('.') || n.ends_with(".part"));
        !hidden && !p.starts_with(cache_dir)
    })
}
