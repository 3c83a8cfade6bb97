//! Update-service records for installers.

use crate::hash::Sha256Digest;
use crate::platform::{Channel, Platform};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of an update-service answer (`/api/update/<platform>/<channel>/<commit>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    /// Payload download URL.
    pub url: String,
    /// Release name, normally the product version.
    pub name: String,
    /// Build identifier (commit hash).
    pub version: String,
    /// Product version (`1.90.2`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_version: Option<String>,
    /// Legacy sha1 of the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Build timestamp in milliseconds since the epoch.
    #[serde(default)]
    pub timestamp: i64,
    /// SHA256 of the payload.
    #[serde(
        rename = "sha256hash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sha256: Option<Sha256Digest>,
    /// Fields this mirror does not interpret (`supportsFastUpdate`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UpdateInfo {
    /// Product version if reported, else the release name.
    pub fn display_version(&self) -> &str {
        self.product_version.as_deref().unwrap_or(&self.name)
    }

    /// File extension of the upstream payload, taken from the URL.
    ///
    /// Compound archive suffixes (`tar.gz`) are kept whole; version numbers in
    /// upstream file names rule out splitting on the first dot.
    pub fn payload_extension(&self) -> String {
        let path = self
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let file = path.rsplit('/').next().unwrap_or_default();
        for compound in ["tar.gz", "tar.xz", "tar.bz2"] {
            if file.ends_with(&format!(".{compound}")) {
                return compound.to_string();
            }
        }
        std::path::Path::new(file)
            .extension()
            .and_then(|e| e.to_str())
            .map_or_else(|| "bin".to_string(), str::to_string)
    }

    /// Local payload file name: `vscode-<name>-<commit>.<ext>`.
    ///
    /// Release names repeat across builds, so the commit keeps each build's
    /// payload distinct.
    pub fn payload_file_name(&self) -> String {
        format!("vscode-{}-{}.{}", self.name, self.version, self.payload_extension())
    }
}

/// What the store keeps per build in `latest.json` and `<commit>.json`.
///
/// The record holds nothing that changes between two syncs of the same build,
/// so re-running a sync against an unchanged upstream rewrites no bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryRecord {
    /// Upstream answer, verbatim apart from `url`.
    #[serde(flatten)]
    pub update: UpdateInfo,
    /// Payload file name, relative to the record's directory.
    pub file: String,
    /// Platform the build was fetched for.
    pub platform: &'static Platform,
    /// Channel the build was fetched from.
    pub channel: Channel,
}

impl BinaryRecord {
    /// Wrap an upstream answer for `platform`/`channel`.
    pub fn new(update: UpdateInfo, platform: &'static Platform, channel: Channel) -> Self {
        let file = update.payload_file_name();
        Self {
            update,
            file,
            platform,
            channel,
        }
    }

    /// Build identifier.
    pub fn commit(&self) -> &str {
        &self.update.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(url: &str) -> UpdateInfo {
        serde_json::from_value(serde_json::json!({
            "url": url,
            "name": "1.90.2",
            "version": "abc123",
            "productVersion": "1.90.2",
            "timestamp": 1_718_000_000_000_i64,
            "sha256hash": "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
            "supportsFastUpdate": true
        }))
        .unwrap()
    }

    #[test]
    fn payload_names_keep_compound_suffixes() {
        assert_eq!(
            info("https://az764295.vo.msecnd.net/stable/abc/code-stable-x64-1718.tar.gz").payload_file_name(),
            "vscode-1.90.2-abc123.tar.gz"
        );
        assert_eq!(
            info("https://host/stable/abc/VSCodeUserSetup-x64-1.90.2.exe?x=1").payload_file_name(),
            "vscode-1.90.2-abc123.exe"
        );
        assert_eq!(info("https://host/noext").payload_extension(), "bin");
    }

    #[test]
    fn record_round_trip_keeps_unknown_fields() {
        let p = Platform::lookup("linux-x64").unwrap();
        let rec = BinaryRecord::new(info("https://host/a/code.deb"), p, Channel::Stable);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["platform"], "linux-x64");
        assert_eq!(json["channel"], "stable");
        assert_eq!(json["file"], "vscode-1.90.2-abc123.deb");
        assert_eq!(json["supportsFastUpdate"], true);
        let back: BinaryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
        assert_eq!(back.commit(), "abc123");
    }
}
