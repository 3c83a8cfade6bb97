//! Download ledger: which upstream payloads are already on disk.

use crate::store::{StoreError, read_json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use vscmirror_schema::Sha256Digest;

/// A single mirrored asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Digest of the stored bytes.
    pub sha256: Sha256Digest,
    /// Location relative to the store root.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// Persistent map of asset source URL to what was stored for it.
///
/// Lets the sync engine skip downloads it has already done, and materialise
/// identical bytes under a second label with a hard link instead of a second
/// download. Serialized as JSON at `extensions/.ledger.json`. Entries carry no
/// timestamps, so an unchanged ledger serializes to identical bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetLedger {
    /// Asset URL to [`LedgerEntry`].
    pub entries: BTreeMap<String, LedgerEntry>,
}

impl AssetLedger {
    /// Load the ledger.
    ///
    /// Returns an empty ledger if the file does not exist or cannot be
    /// parsed; a lost ledger only costs re-downloads.
    pub fn load(path: &Path) -> Self {
        match read_json::<Self>(path) {
            Ok(Some(ledger)) => ledger,
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable asset ledger");
                Self::default()
            }
        }
    }

    /// Look up the entry for an asset URL.
    pub fn get(&self, url: &str) -> Option<&LedgerEntry> {
        self.entries.get(url)
    }

    /// Any entry holding bytes with this digest.
    pub fn find_by_digest(&self, sha256: &Sha256Digest) -> Option<&LedgerEntry> {
        self.entries.values().find(|e| &e.sha256 == sha256)
    }

    /// Insert or replace the entry for `url`. Returns whether the ledger changed.
    pub fn insert(&mut self, url: String, entry: LedgerEntry) -> bool {
        if self.entries.get(&url) == Some(&entry) {
            return false;
        }
        self.entries.insert(url, entry);
        true
    }

    /// Drop entries whose files no longer exist under `root`.
    pub fn prune_missing(&mut self, root: &Path) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| root.join(&e.path).is_file());
        before - self.entries.len()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist through the store so unchanged ledgers are not rewritten.
    ///
    /// An empty ledger is not written unless a file already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on serialization or filesystem failure.
    pub fn save(&self, store: &crate::store::ArtifactStore) -> Result<bool, StoreError> {
        let path = store.layout().ledger();
        if self.is_empty() && !path.exists() {
            return Ok(false);
        }
        store.write_json_if_changed(&path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::StoreLayout;
    use crate::store::ArtifactStore;
    use tempfile::TempDir;

    fn entry(path: &str, data: &[u8]) -> LedgerEntry {
        LedgerEntry {
            sha256: Sha256Digest::of(data),
            path: PathBuf::from(path),
            size: data.len() as u64,
        }
    }

    #[test]
    fn insert_reports_changes() {
        let mut ledger = AssetLedger::default();
        assert!(ledger.insert("u1".into(), entry("a", b"x")));
        assert!(!ledger.insert("u1".into(), entry("a", b"x")));
        assert!(ledger.insert("u1".into(), entry("b", b"x")));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.find_by_digest(&Sha256Digest::of(b"x")).unwrap().path, PathBuf::from("b"));
    }

    #[test]
    fn save_load_and_prune() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(StoreLayout::new(dir.path())).unwrap();
        std::fs::write(dir.path().join("kept"), b"k").unwrap();

        let mut ledger = AssetLedger::default();
        ledger.insert("u1".into(), entry("kept", b"k"));
        ledger.insert("u2".into(), entry("gone", b"g"));
        assert!(ledger.save(&store).unwrap());
        assert!(!ledger.save(&store).unwrap());

        let mut loaded = AssetLedger::load(&store.layout().ledger());
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.prune_missing(dir.path()), 1);
        assert!(loaded.get("u1").is_some());
    }

    #[test]
    fn corrupt_ledger_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".ledger.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(AssetLedger::load(&path).is_empty());
    }

    #[test]
    fn empty_ledger_is_not_created() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(StoreLayout::new(dir.path())).unwrap();
        assert!(!AssetLedger::default().save(&store).unwrap());
        assert!(!store.layout().ledger().exists());
    }
}
