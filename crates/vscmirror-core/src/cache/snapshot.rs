//! Immutable projection of the extension tree.
//!
//! # File format
//!
//! ```text
//! b"VSCMSNAP" | format version (u32 LE) | blake3(payload) (32 bytes) | payload
//! ```
//!
//! The payload is the snapshot as JSON, zstd-compressed. A file whose magic,
//! version or digest does not check out is never deserialized.

use crate::cache::CacheError;
use crate::paths::{EXTENSION_FILE, LATEST_FILE, StoreLayout, UPDATED_MARKER};
use crate::store::{StoreError, atomic_write, read_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use vscmirror_schema::version::sort_newest_first;
use vscmirror_schema::{Blake3Hash, ExtensionId, GalleryExtension, GalleryVersion, MaliciousList, ZSTD_MAGIC};
use walkdir::WalkDir;

/// Leading bytes of a persisted snapshot.
pub const SNAPSHOT_MAGIC: [u8; 8] = *b"VSCMSNAP";
/// Bumped whenever the payload shape changes.
pub const FORMAT_VERSION: u32 = 1;
/// File name of the persisted snapshot inside the cache directory.
pub const SNAPSHOT_FILE: &str = ".gallery-snapshot.bin";

const HEADER_LEN: usize = SNAPSHOT_MAGIC.len() + 4 + 32;
const ZSTD_LEVEL: i32 = 3;

/// Where an entry was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// The mirrored `extensions/` tree.
    Mirrored,
    /// The custom (private) extensions tree.
    Custom,
}

/// One extension as the gallery serves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionEntry {
    /// Marketplace metadata; `versions` holds every stored build, newest first.
    pub extension: GalleryExtension,
    /// Which tree it came from.
    pub source: EntrySource,
}

/// Aggregate counts over a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    /// Extensions, mirrored and custom.
    pub extensions: usize,
    /// Stored builds across all extensions.
    pub versions: usize,
    /// Distinct publishers.
    pub publishers: usize,
    /// Extensions from the custom tree.
    pub custom: usize,
    /// Extensions marked as recommended.
    pub recommended: usize,
    /// Identifiers on the malicious list.
    pub malicious: usize,
}

/// A point-in-time view of every servable extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Monotonic build counter.
    pub generation: u64,
    /// When the tree was scanned.
    pub built_at: DateTime<Utc>,
    /// Entries by identifier.
    pub extensions: BTreeMap<ExtensionId, ExtensionEntry>,
    /// Upstream malicious list at build time.
    pub malicious: MaliciousList,
    /// Counts over the above.
    pub stats: SnapshotStats,
}

impl CacheSnapshot {
    /// A snapshot with nothing in it.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            built_at: Utc::now(),
            extensions: BTreeMap::new(),
            malicious: MaliciousList::default(),
            stats: SnapshotStats::default(),
        }
    }

    /// Scan the store and build generation `generation`.
    ///
    /// Unreadable extension directories are logged and left out. A malicious
    /// list that exists but cannot be parsed fails the build, so a previous
    /// snapshot with a valid list stays in service.
    ///
    /// # Errors
    ///
    /// [`CacheError::Io`] if a tree cannot be listed, [`CacheError::Malicious`]
    /// for an unreadable malicious list.
    pub fn build(layout: &StoreLayout, generation: u64) -> Result<Self, CacheError> {
        let malicious = load_malicious(&layout.malicious())?;
        let mut extensions = BTreeMap::new();
        for (id, entry) in scan_tree(&layout.extensions(), EntrySource::Mirrored)? {
            extensions.insert(id, entry);
        }
        for (id, entry) in scan_tree(layout.custom_extensions(), EntrySource::Custom)? {
            if extensions.contains_key(&id) {
                tracing::debug!(%id, "Custom extension overrides mirrored copy");
            }
            extensions.insert(id, entry);
        }

        let stats = compute_stats(&extensions, &malicious);
        Ok(Self {
            generation,
            built_at: Utc::now(),
            extensions,
            malicious,
            stats,
        })
    }

    /// Look up an entry.
    pub fn get(&self, id: &ExtensionId) -> Option<&ExtensionEntry> {
        self.extensions.get(id)
    }

    /// Serialize, compress and frame.
    ///
    /// # Errors
    ///
    /// [`CacheError::Encode`] if serialization or compression fails.
    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        let json = serde_json::to_vec(self).map_err(|e| CacheError::Encode(e.to_string()))?;
        let payload =
            zstd::encode_all(&json[..], ZSTD_LEVEL).map_err(|e| CacheError::Encode(e.to_string()))?;
        let digest = Blake3Hash::compute(&payload)
            .to_bytes()
            .ok_or_else(|| CacheError::Encode("digest is not 32 bytes".to_string()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&digest);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Check framing and integrity, then decompress and deserialize.
    ///
    /// # Errors
    ///
    /// [`CacheError::Corrupt`] naming the first check that failed.
    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let corrupt = |reason: &str| CacheError::Corrupt(reason.to_string());
        if bytes.len() < HEADER_LEN {
            return Err(corrupt("truncated header"));
        }
        let (magic, rest) = bytes.split_at(SNAPSHOT_MAGIC.len());
        if magic != SNAPSHOT_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let (version, rest) = rest.split_at(4);
        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(version);
        let version = u32::from_le_bytes(version_bytes);
        if version != FORMAT_VERSION {
            return Err(CacheError::Corrupt(format!(
                "format version {version}, expected {FORMAT_VERSION}"
            )));
        }
        let (digest, payload) = rest.split_at(32);
        let mut digest_bytes = [0u8; 32];
        digest_bytes.copy_from_slice(digest);
        if Blake3Hash::from_bytes(digest_bytes) != Blake3Hash::compute(payload) {
            return Err(corrupt("digest mismatch"));
        }
        if payload.len() < 4 || payload[0..4] != ZSTD_MAGIC {
            return Err(corrupt("payload is not zstd"));
        }
        let json = zstd::decode_all(payload).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| CacheError::Corrupt(e.to_string()))
    }

    /// Write the encoded snapshot atomically to `dir`. Returns its size.
    ///
    /// # Errors
    ///
    /// Encoding or filesystem failure.
    pub fn persist(&self, dir: &Path) -> Result<u64, CacheError> {
        let bytes = self.encode()?;
        atomic_write(&dir.join(SNAPSHOT_FILE), &bytes).map_err(CacheError::from)?;
        Ok(bytes.len() as u64)
    }

    /// Load the snapshot persisted in `dir` if it is still current.
    ///
    /// Returns `None` when there is no file or when anything in the store is
    /// newer than it. The second value is the file size.
    ///
    /// # Errors
    ///
    /// [`CacheError::Corrupt`] if the file fails its integrity checks.
    pub fn load_persisted(dir: &Path, layout: &StoreLayout) -> Result<Option<(Self, u64)>, CacheError> {
        let path = dir.join(SNAPSHOT_FILE);
        let written = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io { path, source: e }),
        };
        if newest_input(layout).is_some_and(|newest| newest > written) {
            tracing::info!(path = %path.display(), "Persisted snapshot is older than the store");
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })?;
        let snapshot = Self::decode(&bytes)?;
        Ok(Some((snapshot, bytes.len() as u64)))
    }
}

fn load_malicious(path: &Path) -> Result<MaliciousList, CacheError> {
    match std::fs::read(path) {
        Ok(bytes) => MaliciousList::from_control_file(&bytes).map_err(|source| {
            CacheError::Malicious {
                path: path.to_path_buf(),
                source,
            }
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MaliciousList::default()),
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Read every `<id>/latest.json` under `root`, with the builds found in
/// `<id>/<version>[/<target>]/extension.json`.
fn scan_tree(root: &Path, source: EntrySource) -> Result<Vec<(ExtensionId, ExtensionEntry)>, CacheError> {
    let listing = match std::fs::read_dir(root) {
        Ok(listing) => listing,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(CacheError::Io {
                path: root.to_path_buf(),
                source,
            });
        }
    };

    let mut entries = Vec::new();
    for dir in listing.flatten() {
        let path = dir.path();
        let name = dir.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') || !path.is_dir() {
            continue;
        }
        let id = match ExtensionId::parse(name) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping directory");
                continue;
            }
        };
        match read_extension(&path) {
            Ok(Some(extension)) => entries.push((id, ExtensionEntry { extension, source })),
            Ok(None) => tracing::debug!(%id, "No metadata yet"),
            Err(e) => tracing::warn!(%id, error = %e, "Skipping unreadable extension"),
        }
    }
    Ok(entries)
}

fn read_extension(dir: &Path) -> Result<Option<GalleryExtension>, StoreError> {
    let Some(mut extension) = read_json::<GalleryExtension>(&dir.join(LATEST_FILE))? else {
        return Ok(None);
    };

    let mut versions: Vec<GalleryVersion> = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(2)
        .max_depth(3)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name() == EXTENSION_FILE)
    {
        match read_json::<GalleryVersion>(entry.path()) {
            Ok(Some(v)) => versions.push(v),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Skipping unreadable build"),
        }
    }
    if !versions.is_empty() {
        extension.versions = versions;
    }
    sort_newest_first(&mut extension.versions);
    Ok(Some(extension))
}

fn compute_stats(
    extensions: &BTreeMap<ExtensionId, ExtensionEntry>,
    malicious: &MaliciousList,
) -> SnapshotStats {
    let publishers: BTreeSet<&str> = extensions.keys().map(ExtensionId::publisher).collect();
    SnapshotStats {
        extensions: extensions.len(),
        versions: extensions.values().map(|e| e.extension.versions.len()).sum(),
        publishers: publishers.len(),
        custom: extensions
            .values()
            .filter(|e| e.source == EntrySource::Custom)
            .count(),
        recommended: extensions.values().filter(|e| e.extension.recommended).count(),
        malicious: malicious.len(),
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Newest modification time among the inputs of a snapshot build: the
/// extension directories and their markers, the malicious list, and every
/// file of the custom tree.
pub fn newest_input(layout: &StoreLayout) -> Option<SystemTime> {
    let mut candidates: Vec<PathBuf> = vec![layout.extensions(), layout.malicious()];
    if let Ok(listing) = std::fs::read_dir(layout.extensions()) {
        for dir in listing.flatten() {
            candidates.push(dir.path());
            candidates.push(dir.path().join(UPDATED_MARKER));
        }
    }
    candidates.extend(
        WalkDir::new(layout.custom_extensions())
            .into_iter()
            .filter_map(Result::ok)
            .map(walkdir::DirEntry::into_path),
    );
    candidates.iter().filter_map(|p| modified(p)).max()
}
