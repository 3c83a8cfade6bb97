//! Artifact store layout.
//!
//! ```text
//! <root>/
//! ├── installers/<platform>/<channel>/{latest.json,<commit>.json,vscode-<ver>.<ext>}
//! ├── extensions/<publisher.name>/{latest.json,updated.json}
//! ├── extensions/<publisher.name>/<version>/[<target>/]{extension.json,<assetType>...}
//! ├── extensions/.ledger.json
//! ├── custom-extensions/...
//! ├── malicious.json
//! ├── workspaceRecommendations.json.gz
//! └── sync-state.json
//! ```

use std::path::{Path, PathBuf};
use vscmirror_schema::{Channel, ExtensionId, Platform};

/// Name of the per-build and per-extension "current" record.
pub const LATEST_FILE: &str = "latest.json";
/// Per-version metadata file.
pub const EXTENSION_FILE: &str = "extension.json";
/// Marker touched whenever the sync engine changes an extension.
pub const UPDATED_MARKER: &str = "updated.json";

/// Resolves every path in the artifact store from its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
    custom: PathBuf,
}

impl StoreLayout {
    /// Layout rooted at `root`, with custom extensions under `root/custom-extensions`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let custom = root.join("custom-extensions");
        Self { root, custom }
    }

    /// Use a different directory for custom extensions.
    pub fn with_custom_extensions(mut self, dir: impl Into<PathBuf>) -> Self {
        self.custom = dir.into();
        self
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `installers/`
    pub fn installers(&self) -> PathBuf {
        self.root.join("installers")
    }

    /// `installers/<platform>/<channel>/`
    pub fn installer_dir(&self, platform: &Platform, channel: Channel) -> PathBuf {
        self.installers().join(platform.id).join(channel.as_str())
    }

    /// `installers/<platform>/<channel>/latest.json`
    pub fn binary_latest(&self, platform: &Platform, channel: Channel) -> PathBuf {
        self.installer_dir(platform, channel).join(LATEST_FILE)
    }

    /// `installers/<platform>/<channel>/<commit>.json`
    pub fn binary_commit(&self, platform: &Platform, channel: Channel, commit: &str) -> PathBuf {
        self.installer_dir(platform, channel)
            .join(format!("{commit}.json"))
    }

    /// `extensions/`
    pub fn extensions(&self) -> PathBuf {
        self.root.join("extensions")
    }

    /// `extensions/<publisher.name>/`
    pub fn extension_dir(&self, id: &ExtensionId) -> PathBuf {
        self.extensions().join(id)
    }

    /// `extensions/<publisher.name>/latest.json`
    pub fn extension_latest(&self, id: &ExtensionId) -> PathBuf {
        self.extension_dir(id).join(LATEST_FILE)
    }

    /// `extensions/<publisher.name>/updated.json`
    pub fn extension_marker(&self, id: &ExtensionId) -> PathBuf {
        self.extension_dir(id).join(UPDATED_MARKER)
    }

    /// `extensions/<publisher.name>/<version>[/<target>]/`
    pub fn version_dir(&self, id: &ExtensionId, relative: &str) -> PathBuf {
        self.extension_dir(id).join(relative)
    }

    /// `extensions/.ledger.json`
    pub fn ledger(&self) -> PathBuf {
        self.extensions().join(".ledger.json")
    }

    /// Custom (private) extensions tree.
    pub fn custom_extensions(&self) -> &Path {
        &self.custom
    }

    /// `malicious.json`
    pub fn malicious(&self) -> PathBuf {
        self.root.join("malicious.json")
    }

    /// `workspaceRecommendations.json.gz`
    pub fn recommendations(&self) -> PathBuf {
        self.root.join("workspaceRecommendations.json.gz")
    }

    /// `sync-state.json`
    pub fn sync_state(&self) -> PathBuf {
        self.root.join("sync-state.json")
    }
}

/// Extract the filename from a URL.
pub fn filename_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.split('/').next_back().unwrap_or("")
}

/// Whether an upstream-supplied string is usable as a single path segment.
///
/// Version strings, target platforms and asset types all become directory
/// or file names, so anything that could climb out of its parent is refused.
pub fn is_safe_segment(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && !s.starts_with('.')
        && !s.contains(['/', '\\', '\0', ':'])
}
