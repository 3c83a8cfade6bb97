//! Mirror configuration.
//!
//! One TOML document with a `[sync]` and a `[gallery]` table. Every field has
//! a default, so an empty file (or no file) is a valid configuration that
//! mirrors stable desktop builds and recommended extensions.
//!
//! ```toml
//! artifacts = "/srv/vscmirror"
//!
//! [sync]
//! include_server = true
//! channels = ["stable", "insider"]
//! exclude_platforms = ["linux-snap"]
//!
//! [gallery]
//! url_root = "https://vscode.corp.example"
//! malicious_policy = "flag"
//! ```

use crate::io::retry::RetryPolicy;
use crate::paths::StoreLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vscmirror_schema::{Category, Channel, Platform, PlatformError};

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },

    /// A platform or channel token is not recognised.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// A value is out of range or inconsistent with another.
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted key of the offending option.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`].
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorConfig {
    /// Artifact store root.
    pub artifacts: PathBuf,
    /// Sync engine options.
    pub sync: SyncConfig,
    /// Gallery engine options.
    pub gallery: GalleryConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            artifacts: PathBuf::from("artifacts"),
            sync: SyncConfig::default(),
            gallery: GalleryConfig::default(),
        }
    }
}

impl MirrorConfig {
    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if given, otherwise start from defaults.
    ///
    /// # Errors
    ///
    /// Same as [`MirrorConfig::load`].
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// Store layout implied by `artifacts` and `gallery.custom_extensions`.
    pub fn layout(&self) -> StoreLayout {
        let layout = StoreLayout::new(&self.artifacts);
        match &self.gallery.custom_extensions {
            Some(dir) => layout.with_custom_extensions(dir),
            None => layout,
        }
    }

    /// Check every section. Runs before any network activity.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.artifacts.as_os_str().is_empty() {
            return Err(ConfigError::invalid("artifacts", "must not be empty"));
        }
        self.sync.validate()?;
        self.gallery.validate()
    }
}

/// Which extension sources feed the sync work list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtensionSources {
    /// Workspace recommendations plus the most-installed extensions.
    pub recommended: bool,
    /// Identifiers listed in `sync.specified_file`.
    pub specified: bool,
    /// Every extension in the marketplace.
    pub all: bool,
}

impl Default for ExtensionSources {
    fn default() -> Self {
        Self {
            recommended: true,
            specified: false,
            all: false,
        }
    }
}

impl ExtensionSources {
    /// Whether any source is enabled.
    pub fn any(&self) -> bool {
        self.recommended || self.specified || self.all
    }
}

/// Retry knobs for the fetch client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    /// First backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the delay (0.0 - 1.0).
    pub jitter: f64,
    /// Give up once this many seconds have passed since the first attempt.
    pub max_elapsed_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.25,
            max_elapsed_secs: 300,
        }
    }
}

impl RetrySettings {
    /// Build the runtime policy.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            max_elapsed: Duration::from_secs(self.max_elapsed_secs),
        }
    }
}

/// Upstream endpoints. Overridable for testing and for chained mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamUrls {
    /// Update service base, `.../api/update`.
    pub update: String,
    /// Marketplace `extensionquery` endpoint.
    pub marketplace: String,
    /// Gzipped workspace recommendations.
    pub recommendations: String,
    /// Marketplace control file holding the malicious list.
    pub malicious: String,
}

impl Default for UpstreamUrls {
    fn default() -> Self {
        Self {
            update: "https://update.code.visualstudio.com/api/update".to_string(),
            marketplace: "https://marketplace.visualstudio.com/_apis/public/gallery/extensionquery"
                .to_string(),
            recommendations:
                "https://main.vscode-cdn.net/extensions/workspaceRecommendations.json.gz"
                    .to_string(),
            malicious: "https://main.vscode-cdn.net/extensions/marketplace.json".to_string(),
        }
    }
}

/// Sync engine options (`[sync]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Explicit platform list. Empty means every desktop platform.
    pub platforms: Vec<String>,
    /// Platforms removed after everything else is applied.
    pub exclude_platforms: Vec<String>,
    /// Add remote-development server builds.
    pub include_server: bool,
    /// Add standalone CLI builds.
    pub include_cli: bool,
    /// Keep ARM platforms that were not listed explicitly.
    pub include_arm: bool,
    /// Channels to mirror.
    pub channels: Vec<Channel>,
    /// Mirror installers at all.
    pub binaries: bool,
    /// Extension sources.
    pub extensions: ExtensionSources,
    /// Identifier list for the `specified` source.
    pub specified_file: Option<PathBuf>,
    /// Mirror prerelease extension builds.
    pub prerelease: bool,
    /// Cap on the `recommended` source.
    pub total_recommended: usize,
    /// Builds kept per extension and target platform.
    pub versions_per_extension: usize,
    /// Client version presented upstream in the `User-Agent`.
    pub masquerade_version: String,
    /// Concurrent work items.
    pub workers: usize,
    /// Stop starting new work after this many seconds.
    pub max_duration_secs: Option<u64>,
    /// Pause between continuous-mode runs, in seconds.
    pub frequency_secs: u64,
    /// Keep `<commit>.json` records and payloads of superseded builds.
    pub keep_history: bool,
    /// Re-download even when the stored build is current.
    pub force: bool,
    /// Fetch retry behaviour.
    pub retry: RetrySettings,
    /// Upstream endpoints.
    pub upstream: UpstreamUrls,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            platforms: Vec::new(),
            exclude_platforms: Vec::new(),
            include_server: false,
            include_cli: false,
            include_arm: false,
            channels: vec![Channel::Stable],
            binaries: true,
            extensions: ExtensionSources::default(),
            specified_file: None,
            prerelease: false,
            total_recommended: 500,
            versions_per_extension: 1,
            masquerade_version: "1.95.0".to_string(),
            workers: 8,
            max_duration_secs: None,
            frequency_secs: 3600,
            keep_history: false,
            force: false,
            retry: RetrySettings::default(),
            upstream: UpstreamUrls::default(),
        }
    }
}

impl SyncConfig {
    /// Resolve the effective platform set, in catalog order.
    ///
    /// 1. the explicit list, or every desktop platform;
    /// 2. plus server / CLI platforms when their toggles are set;
    /// 3. minus ARM platforms that were not listed, unless `include_arm`;
    /// 4. minus `exclude_platforms`.
    ///
    /// # Errors
    ///
    /// Any unknown token, in either list, is a [`ConfigError::Platform`].
    pub fn resolve_platforms(&self) -> Result<Vec<&'static Platform>, ConfigError> {
        let explicit = self
            .platforms
            .iter()
            .map(|p| Platform::lookup(p))
            .collect::<Result<Vec<_>, _>>()?;
        let excluded = self
            .exclude_platforms
            .iter()
            .map(|p| Platform::lookup(p))
            .collect::<Result<Vec<_>, _>>()?;

        let resolved = Platform::catalog()
            .iter()
            .filter(|p| {
                let listed = explicit.contains(p);
                let base = if explicit.is_empty() {
                    p.category == Category::Desktop
                } else {
                    listed
                };
                let toggled = match p.category {
                    Category::Server => self.include_server,
                    Category::Cli => self.include_cli,
                    Category::Desktop => false,
                };
                base || toggled
            })
            .filter(|p| !p.is_arm() || self.include_arm || explicit.contains(p))
            .filter(|p| !excluded.contains(p))
            .collect();
        Ok(resolved)
    }

    /// Runtime retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }

    /// `sync.max_duration_secs` as a duration.
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }

    /// `sync.frequency_secs` as a duration.
    pub fn frequency(&self) -> Duration {
        Duration::from_secs(self.frequency_secs)
    }

    /// Check ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolve_platforms()?;
        if self.channels.is_empty() {
            return Err(ConfigError::invalid("sync.channels", "at least one channel is required"));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("sync.workers", "must be at least 1"));
        }
        if self.versions_per_extension == 0 {
            return Err(ConfigError::invalid(
                "sync.versions_per_extension",
                "must be at least 1",
            ));
        }
        if self.extensions.specified && self.specified_file.is_none() {
            return Err(ConfigError::invalid(
                "sync.specified_file",
                "required when sync.extensions.specified is enabled",
            ));
        }
        if self.masquerade_version.trim().is_empty() {
            return Err(ConfigError::invalid("sync.masquerade_version", "must not be empty"));
        }
        if self.frequency_secs == 0 {
            return Err(ConfigError::invalid("sync.frequency_secs", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("sync.retry.max_attempts", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::invalid("sync.retry.jitter", "must be between 0 and 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "sync.retry.base_delay_ms",
                "must not exceed sync.retry.max_delay_ms",
            ));
        }
        for (field, url) in [
            ("sync.upstream.update", &self.upstream.update),
            ("sync.upstream.marketplace", &self.upstream.marketplace),
            ("sync.upstream.recommendations", &self.upstream.recommendations),
            ("sync.upstream.malicious", &self.upstream.malicious),
        ] {
            check_url(field, url)?;
        }
        Ok(())
    }
}

/// How the gallery treats extensions on the malicious list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaliciousPolicy {
    /// Drop them from every response.
    #[default]
    Exclude,
    /// Serve them with a `malicious` flag so clients can warn.
    Flag,
}

/// Gallery engine options (`[gallery]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GalleryConfig {
    /// Socket address to bind.
    pub listen: String,
    /// Public base URL of this mirror, used in rewritten asset URIs.
    pub url_root: String,
    /// Where the persisted snapshot lives. Defaults to the store root.
    pub cache_dir: Option<PathBuf>,
    /// Timer-driven refresh interval in seconds.
    pub refresh_interval_secs: u64,
    /// Quiet period after a filesystem event before rebuilding.
    pub debounce_ms: u64,
    /// Treatment of malicious extensions.
    pub malicious_policy: MaliciousPolicy,
    /// Directory of private extensions. Defaults to `<artifacts>/custom-extensions`.
    pub custom_extensions: Option<PathBuf>,
    /// Watch the store for changes.
    pub watch: bool,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            url_root: "http://localhost:8080".to_string(),
            cache_dir: None,
            refresh_interval_secs: 3600,
            debounce_ms: 2000,
            malicious_policy: MaliciousPolicy::default(),
            custom_extensions: None,
            watch: true,
        }
    }
}

impl GalleryConfig {
    /// `gallery.refresh_interval_secs` as a duration.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// `gallery.debounce_ms` as a duration.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Check ranges.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen
            .parse::<std::net::SocketAddr>()
            .map_err(|e| ConfigError::invalid("gallery.listen", e.to_string()))?;
        check_url("gallery.url_root", &self.url_root)?;
        if self.refresh_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "gallery.refresh_interval_secs",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn check_url(field: &'static str, url: &str) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::invalid(
            field,
            format!("unsupported scheme '{other}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(platforms: &[&'static Platform]) -> Vec<&'static str> {
        platforms.iter().map(|p| p.id).collect()
    }

    #[test]
    fn empty_document_is_valid() {
        let cfg: MirrorConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, MirrorConfig::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn default_platforms_are_desktop_without_arm() {
        let resolved = SyncConfig::default().resolve_platforms().unwrap();
        let ids = ids(&resolved);
        assert!(ids.contains(&"linux-x64"));
        assert!(ids.contains(&"darwin-universal"));
        assert!(!ids.contains(&"linux-arm64"));
        assert!(!ids.iter().any(|id| id.starts_with("server-") || id.starts_with("cli-")));
    }

    #[test]
    fn toggles_add_categories_and_arm() {
        let cfg = SyncConfig {
            include_server: true,
            include_arm: true,
            ..SyncConfig::default()
        };
        let resolved = ids(&cfg.resolve_platforms().unwrap());
        assert!(resolved.contains(&"server-linux-arm64"));
        assert!(resolved.contains(&"darwin-arm64"));
        assert!(!resolved.contains(&"cli-alpine"));
    }

    #[test]
    fn explicit_arm_survives_without_toggle() {
        let cfg = SyncConfig {
            platforms: vec!["linux-arm64".into(), "win32-x64".into()],
            include_cli: true,
            ..SyncConfig::default()
        };
        let resolved = ids(&cfg.resolve_platforms().unwrap());
        assert!(resolved.contains(&"linux-arm64"));
        assert!(resolved.contains(&"win32-x64"));
        assert!(resolved.contains(&"cli-linux-x64"));
        assert!(!resolved.contains(&"cli-linux-arm64"));
        assert!(!resolved.contains(&"linux-x64"));
    }

    #[test]
    fn listed_platform_with_cli_then_excluded() {
        let mut cfg = SyncConfig {
            platforms: vec!["darwin-arm64".into()],
            include_cli: true,
            ..SyncConfig::default()
        };
        let cli = [
            "cli-linux",
            "cli-linux-x64",
            "cli-darwin",
            "cli-darwin-x64",
            "cli-win32",
            "cli-win32-x64",
            "cli-alpine",
        ];
        let mut expected = vec!["darwin-arm64"];
        expected.extend(cli);
        assert_eq!(ids(&cfg.resolve_platforms().unwrap()), expected);

        cfg.exclude_platforms = vec!["darwin-arm64".into()];
        assert_eq!(ids(&cfg.resolve_platforms().unwrap()), cli.to_vec());
    }

    #[test]
    fn exclusions_apply_last() {
        let cfg = SyncConfig {
            platforms: vec!["linux-x64".into(), "linux-deb".into()],
            exclude_platforms: vec!["LINUX-DEB".into()],
            ..SyncConfig::default()
        };
        assert_eq!(ids(&cfg.resolve_platforms().unwrap()), vec!["linux-x64"]);
    }

    #[test]
    fn unknown_platform_is_rejected() {
        let cfg = SyncConfig {
            exclude_platforms: vec!["amiga".into()],
            ..SyncConfig::default()
        };
        assert!(matches!(
            cfg.resolve_platforms(),
            Err(ConfigError::Platform(PlatformError::UnknownPlatform(_)))
        ));
    }

    #[test]
    fn parses_full_document() {
        let cfg: MirrorConfig = toml::from_str(
            r#"
            artifacts = "/srv/mirror"

            [sync]
            channels = ["stable", "insider"]
            workers = 4
            versions_per_extension = 3
            extensions = { recommended = false, specified = true }
            specified_file = "/etc/vscmirror/extensions.txt"

            [sync.retry]
            max_attempts = 7

            [gallery]
            url_root = "https://mirror.example"
            malicious_policy = "flag"
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.sync.channels, vec![Channel::Stable, Channel::Insider]);
        assert_eq!(cfg.sync.retry.max_attempts, 7);
        assert_eq!(cfg.sync.retry.base_delay_ms, 500);
        assert!(cfg.sync.extensions.specified);
        assert!(!cfg.sync.extensions.all);
        assert_eq!(cfg.gallery.malicious_policy, MaliciousPolicy::Flag);
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        let mut cfg = MirrorConfig::default();
        cfg.sync.extensions.specified = true;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "sync.specified_file", .. })
        ));

        let mut cfg = MirrorConfig::default();
        cfg.gallery.url_root = "ftp://mirror".into();
        assert!(cfg.validate().is_err());

        let mut cfg = MirrorConfig::default();
        cfg.sync.workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<MirrorConfig>("[sync]\nplatfroms = []").is_err());
    }
}
