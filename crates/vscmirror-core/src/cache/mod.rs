//! Metadata cache.
//!
//! Holds the current [`CacheSnapshot`] behind a `watch` channel and rebuilds
//! it in a single background task. Readers clone an `Arc` and never wait for
//! a rebuild; a rebuild publishes a complete new snapshot or nothing.
//!
//! Triggers (timer, debounced filesystem change, [`MetadataCache::force_refresh`])
//! are all funnelled into that one task, so they coalesce: however many
//! arrive during a rebuild, at most one more rebuild follows it.

pub mod snapshot;
pub mod watch;

use crate::config::GalleryConfig;
use crate::error::ErrorKind;
use crate::paths::StoreLayout;
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use notify::RecommendedWatcher;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

pub use snapshot::{CacheSnapshot, EntrySource, ExtensionEntry, SnapshotStats};

/// Snapshot build and persistence failures.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A tree or file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The malicious list exists but does not parse.
    #[error("Malicious list {path} is unreadable: {source}")]
    Malicious {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A persisted snapshot failed its integrity checks.
    #[error("Persisted snapshot is corrupt: {0}")]
    Corrupt(String),

    /// A snapshot could not be serialized or compressed.
    #[error("Failed to encode snapshot: {0}")]
    Encode(String),

    /// Writing the persisted snapshot failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The store watcher could not be set up.
    #[error("Store watcher failed: {0}")]
    Watch(#[from] notify::Error),

    /// The blocking build task died.
    #[error("Snapshot build task failed: {0}")]
    Task(String),
}

impl CacheError {
    /// Classify the failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(_) => ErrorKind::Storage,
            _ => ErrorKind::CacheBuild,
        }
    }
}

/// Cache health, as reported by the status surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Generation of the current snapshot.
    pub generation: u64,
    /// When the current snapshot was built.
    pub built_at: DateTime<Utc>,
    /// Seconds since `built_at`.
    pub age_secs: i64,
    /// Encoded size of the current snapshot in bytes.
    pub compressed_size: u64,
    /// When the last rebuild attempt finished.
    pub last_refresh: Option<DateTime<Utc>>,
    /// When the timer will next trigger a rebuild.
    pub next_refresh: Option<DateTime<Utc>>,
    /// A rebuild is running.
    pub indexing: bool,
    /// Error of the last rebuild attempt, if it failed.
    pub last_error: Option<String>,
    /// Counts over the current snapshot.
    #[serde(flatten)]
    pub counts: SnapshotStats,
}

#[derive(Debug, Default)]
struct RefreshStatus {
    compressed_size: u64,
    last_refresh: Option<DateTime<Utc>>,
    next_refresh: Option<DateTime<Utc>>,
    indexing: bool,
    last_error: Option<String>,
}

struct Shared {
    layout: StoreLayout,
    cache_dir: PathBuf,
    persist: bool,
    refresh_interval: Duration,
    debounce: Duration,
    snapshot: tokio::sync::watch::Sender<Arc<CacheSnapshot>>,
    force: Notify,
    changed: mpsc::Sender<()>,
    rebuild_lock: tokio::sync::Mutex<()>,
    status: Mutex<RefreshStatus>,
}

impl Shared {
    fn status(&self) -> std::sync::MutexGuard<'_, RefreshStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Options for [`MetadataCache::start`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Where the snapshot is persisted; `None` keeps it in memory only.
    pub cache_dir: Option<PathBuf>,
    /// Timer-driven rebuild interval.
    pub refresh_interval: Duration,
    /// Quiet period after a filesystem event.
    pub debounce: Duration,
    /// Watch the store for changes.
    pub watch: bool,
}

impl CacheOptions {
    /// Options from the `[gallery]` section. The snapshot is persisted to
    /// `gallery.cache_dir`, or the store root when unset.
    pub fn from_config(config: &GalleryConfig, layout: &StoreLayout) -> Self {
        Self {
            cache_dir: Some(
                config
                    .cache_dir
                    .clone()
                    .unwrap_or_else(|| layout.root().to_path_buf()),
            ),
            refresh_interval: config.refresh_interval(),
            debounce: config.debounce(),
            watch: config.watch,
        }
    }
}

/// The current snapshot plus the task that keeps it fresh.
pub struct MetadataCache {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl MetadataCache {
    /// Load or build the first snapshot, then start the refresh task.
    ///
    /// A persisted snapshot is used when it passes its integrity checks and
    /// nothing in the store is newer; otherwise the tree is scanned.
    ///
    /// # Errors
    ///
    /// Fails when no first snapshot can be produced or the watcher cannot be
    /// set up.
    pub async fn start(
        layout: StoreLayout,
        options: CacheOptions,
        cancel: &CancellationToken,
    ) -> Result<Self, CacheError> {
        let persist = options.cache_dir.is_some();
        let cache_dir = options
            .cache_dir
            .clone()
            .unwrap_or_else(|| layout.root().to_path_buf());

        let loaded = if persist {
            let (dir, l) = (cache_dir.clone(), layout.clone());
            match run_blocking(move || CacheSnapshot::load_persisted(&dir, &l)).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding persisted snapshot");
                    None
                }
            }
        } else {
            None
        };
        let from_disk = loaded.is_some();

        let (tx, rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            layout,
            cache_dir,
            persist,
            refresh_interval: options.refresh_interval,
            debounce: options.debounce,
            snapshot: tokio::sync::watch::Sender::new(Arc::new(CacheSnapshot::empty())),
            force: Notify::new(),
            changed: tx,
            rebuild_lock: tokio::sync::Mutex::new(()),
            status: Mutex::new(RefreshStatus::default()),
        });

        match loaded {
            Some((snapshot, size)) => {
                tracing::info!(
                    generation = snapshot.generation,
                    extensions = snapshot.stats.extensions,
                    "Loaded persisted snapshot"
                );
                let mut status = shared.status();
                status.compressed_size = size;
                status.last_refresh = Some(Utc::now());
                drop(status);
                shared.snapshot.send_replace(Arc::new(snapshot));
            }
            None => {
                rebuild(&shared).await?;
            }
        }

        let watcher = if options.watch {
            Some(watch::watch_store(
                &shared.layout,
                &shared.cache_dir,
                shared.changed.clone(),
            )?)
        } else {
            None
        };

        let cancel = cancel.child_token();
        tokio::spawn(refresh_loop(Arc::clone(&shared), rx, cancel.clone()));
        tracing::info!(from_disk, "Metadata cache started");

        Ok(Self {
            shared,
            cancel,
            _watcher: Mutex::new(watcher),
        })
    }

    /// The current snapshot. Never blocks on a rebuild.
    pub fn current(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.shared.snapshot.borrow())
    }

    /// A receiver that sees every published snapshot.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Arc<CacheSnapshot>> {
        self.shared.snapshot.subscribe()
    }

    /// Ask the refresh task for a rebuild as soon as it is free.
    pub fn force_refresh(&self) {
        self.shared.force.notify_one();
    }

    /// Report a store change, as the watcher does. Debounced.
    pub fn notify_changed(&self) {
        let _ = self.shared.changed.try_send(());
    }

    /// Rebuild now and wait for the result.
    ///
    /// Serialized with the background task's rebuilds.
    ///
    /// # Errors
    ///
    /// The build error; the previous snapshot stays current.
    pub async fn refresh_now(&self) -> Result<Arc<CacheSnapshot>, CacheError> {
        rebuild(&self.shared).await
    }

    /// Cache health.
    pub fn stats(&self) -> CacheStats {
        let snapshot = self.current();
        let status = self.shared.status();
        CacheStats {
            generation: snapshot.generation,
            built_at: snapshot.built_at,
            age_secs: (Utc::now() - snapshot.built_at).num_seconds(),
            compressed_size: status.compressed_size,
            last_refresh: status.last_refresh,
            next_refresh: status.next_refresh,
            indexing: status.indexing,
            last_error: status.last_error.clone(),
            counts: snapshot.stats,
        }
    }

    /// Stop the refresh task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("root", &self.shared.layout.root())
            .field("generation", &self.shared.snapshot.borrow().generation)
            .finish_non_exhaustive()
    }
}

impl Drop for MetadataCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, CacheError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?
}

fn build_and_encode(
    layout: &StoreLayout,
    generation: u64,
    persist_to: Option<&Path>,
) -> Result<(CacheSnapshot, u64), CacheError> {
    let snapshot = CacheSnapshot::build(layout, generation)?;
    let size = match persist_to {
        Some(dir) => match snapshot.persist(dir) {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to persist snapshot");
                snapshot.encode()?.len() as u64
            }
        },
        None => snapshot.encode()?.len() as u64,
    };
    Ok((snapshot, size))
}

async fn rebuild(shared: &Shared) -> Result<Arc<CacheSnapshot>, CacheError> {
    let _serial = shared.rebuild_lock.lock().await;
    shared.status().indexing = true;

    let generation = shared.snapshot.borrow().generation + 1;
    let layout = shared.layout.clone();
    let persist_to = shared.persist.then(|| shared.cache_dir.clone());
    let result =
        run_blocking(move || build_and_encode(&layout, generation, persist_to.as_deref())).await;

    let mut status = shared.status();
    status.indexing = false;
    status.last_refresh = Some(Utc::now());
    match result {
        Ok((snapshot, size)) => {
            status.compressed_size = size;
            status.last_error = None;
            drop(status);
            let snapshot = Arc::new(snapshot);
            shared.snapshot.send_replace(Arc::clone(&snapshot));
            Ok(snapshot)
        }
        Err(e) => {
            status.last_error = Some(e.to_string());
            Err(e)
        }
    }
}

/// Wait until no change has been reported for `quiet`. Returns `false` if
/// cancelled first.
async fn settle(changed: &mut mpsc::Receiver<()>, quiet: Duration, cancel: &CancellationToken) -> bool {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = tokio::time::sleep(quiet) => return true,
            msg = changed.recv() => {
                if msg.is_none() {
                    return true;
                }
            }
        }
    }
}

async fn refresh_loop(shared: Arc<Shared>, mut changed: mpsc::Receiver<()>, cancel: CancellationToken) {
    loop {
        let interval = shared.refresh_interval;
        shared.status().next_refresh = chrono::Duration::from_std(interval)
            .ok()
            .map(|d| Utc::now() + d);

        let reason = tokio::select! {
            () = cancel.cancelled() => break,
            () = shared.force.notified() => "forced",
            Some(()) = changed.recv() => {
                if !settle(&mut changed, shared.debounce, &cancel).await {
                    break;
                }
                "store changed"
            }
            () = tokio::time::sleep(interval) => "interval",
        };

        let previous = shared.snapshot.borrow().generation;
        match rebuild(&shared).await {
            Ok(snapshot) => tracing::info!(
                reason,
                generation = snapshot.generation,
                extensions = snapshot.stats.extensions,
                "Snapshot refreshed"
            ),
            Err(e) => tracing::warn!(
                reason,
                error = %e,
                kept = previous,
                "Snapshot rebuild failed, keeping previous"
            ),
        }
    }
    tracing::debug!("Metadata cache refresh task stopped");
}
