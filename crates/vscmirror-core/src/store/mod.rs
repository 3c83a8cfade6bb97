//! Artifact store writes.
//!
//! All writes are write-to-temp-then-rename in the destination directory.
//! The store counts every write that changes bytes on disk; an idempotent
//! re-sync is one that leaves the counter at zero.

pub mod ledger;

use crate::paths::StoreLayout;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub use ledger::{AssetLedger, LedgerEntry};

/// Local storage failures. Always fatal to a sync run.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("Storage error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A stored document is not valid JSON of the expected shape.
    #[error("Corrupt document {path}: {source}")]
    Json {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Shorthand for [`StoreError::Io`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Write `bytes` to `path` atomically, creating parent directories.
///
/// # Errors
///
/// Returns [`StoreError::Io`] on any filesystem failure.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)
        .map_err(|e| StoreError::io(parent, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Serialize a document the way the store writes every JSON file.
///
/// # Errors
///
/// Returns [`StoreError::Json`] if `value` cannot be serialized.
pub fn to_json_bytes<T: Serialize>(path: &Path, value: &T) -> Result<Vec<u8>, StoreError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Read a JSON document, `None` if the file does not exist.
///
/// # Errors
///
/// Returns [`StoreError::Io`] for read failures other than not-found, and
/// [`StoreError::Json`] if the document does not parse.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// The writable artifact store used by the sync engine.
#[derive(Debug)]
pub struct ArtifactStore {
    layout: StoreLayout,
    writes: AtomicU64,
}

impl ArtifactStore {
    /// Open (and create if needed) the store rooted at `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the top-level directories cannot be created.
    pub fn open(layout: StoreLayout) -> Result<Self, StoreError> {
        for dir in [layout.installers(), layout.extensions()] {
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(Self {
            layout,
            writes: AtomicU64::new(0),
        })
    }

    /// Paths within the store.
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Number of content-changing writes since the store was opened.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Count a write performed outside the store (e.g. a streamed download).
    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Write `bytes` unless `path` already holds exactly these bytes.
    ///
    /// Returns whether anything was written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on filesystem failure.
    pub fn write_if_changed(&self, path: &Path, bytes: &[u8]) -> Result<bool, StoreError> {
        match std::fs::read(path) {
            Ok(existing) if existing == bytes => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(path, e)),
        }
        atomic_write(path, bytes)?;
        self.record_write();
        Ok(true)
    }

    /// Serialize `value` and [`write_if_changed`](Self::write_if_changed).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on serialization or filesystem failure.
    pub fn write_json_if_changed<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<bool, StoreError> {
        let bytes = to_json_bytes(path, value)?;
        self.write_if_changed(path, &bytes)
    }

    /// Write bookkeeping that is not part of the mirrored content.
    ///
    /// Not counted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on serialization or filesystem failure.
    pub fn write_json_untracked<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = to_json_bytes(path, value)?;
        atomic_write(path, &bytes)
    }

    /// Remove a file if present. Returns whether a file was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] for failures other than not-found.
    pub fn remove_file(&self, path: &Path) -> Result<bool, StoreError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                self.record_write();
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Materialise `dest` from an existing file: hard link if possible,
    /// copy otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if neither works.
    pub fn link_or_copy(&self, src: &Path, dest: &Path) -> Result<(), StoreError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        if std::fs::hard_link(src, dest).is_err() {
            let tmp = dest.with_extension("copy-tmp");
            std::fs::copy(src, &tmp).map_err(|e| StoreError::io(src, e))?;
            std::fs::rename(&tmp, dest).map_err(|e| StoreError::io(dest, e))?;
        }
        self.record_write();
        Ok(())
    }
}
