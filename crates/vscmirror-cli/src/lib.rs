//! vscmirror - offline mirror of the VS Code update service and marketplace
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
//!
//! Two halves share one artifact store:
//!
//! - `vscmirror sync` pulls installers and extensions from upstream;
//! - `vscmirror serve` answers the update and gallery protocols from it.
//!
//! Configuration comes from a TOML file (`--config` or `VSCMIRROR_CONFIG`);
//! command-line flags override individual values.

pub mod cmd;
pub mod server;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use vscmirror_core::config::{GalleryConfig, MaliciousPolicy, SyncConfig};
use vscmirror_core::MirrorConfig;
use vscmirror_schema::Channel;

#[derive(Debug, Parser)]
#[command(name = "vscmirror")]
#[command(author, version, about = "Offline mirror of the VS Code update service and extension marketplace")]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, global = true, env = "VSCMIRROR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Artifact store root, overriding `artifacts` in the config file
    #[arg(long, global = true, env = "VSCMIRROR_ARTIFACTS")]
    pub artifacts: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Mirror installers and extensions from upstream
    Sync(SyncArgs),
    /// Serve the update and gallery protocols from the store
    Serve(ServeArgs),
    /// Show the store contents and the last sync outcome
    Status {
        /// Print the status document as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the platform catalog
    Platforms {
        /// Only the platforms the current configuration mirrors
        #[arg(long)]
        resolved: bool,
    },
}

#[derive(Debug, Default, Args)]
pub struct SyncArgs {
    /// Keep running, syncing every `--frequency` seconds
    #[arg(long)]
    pub continuous: bool,

    /// Platforms to mirror (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub platforms: Vec<String>,

    /// Platforms to drop after everything else is applied
    #[arg(long, value_delimiter = ',')]
    pub exclude_platforms: Vec<String>,

    /// Add remote-development server builds
    #[arg(long)]
    pub include_server: bool,

    /// Add standalone CLI builds
    #[arg(long)]
    pub include_cli: bool,

    /// Keep ARM platforms that were not listed explicitly
    #[arg(long)]
    pub include_arm: bool,

    /// Channels to mirror (comma separated: stable, insider)
    #[arg(long, value_delimiter = ',')]
    pub channels: Vec<Channel>,

    /// Skip installers
    #[arg(long)]
    pub no_binaries: bool,

    /// Skip the recommended and most-installed extensions
    #[arg(long)]
    pub no_recommended: bool,

    /// Mirror the extensions listed in this file
    #[arg(long)]
    pub specified: Option<PathBuf>,

    /// Mirror every extension in the marketplace
    #[arg(long)]
    pub all: bool,

    /// Include prerelease extension builds
    #[arg(long)]
    pub prerelease: bool,

    /// Cap on most-installed extensions
    #[arg(long)]
    pub total_recommended: Option<usize>,

    /// Builds kept per extension and target platform
    #[arg(long)]
    pub versions: Option<usize>,

    /// Concurrent work items
    #[arg(long)]
    pub workers: Option<usize>,

    /// Stop starting new work after this many seconds
    #[arg(long)]
    pub max_duration: Option<u64>,

    /// Seconds between runs in continuous mode
    #[arg(long)]
    pub frequency: Option<u64>,

    /// Keep records and payloads of superseded builds
    #[arg(long)]
    pub keep_history: bool,

    /// Re-download even when the stored build is current
    #[arg(long)]
    pub force: bool,

    /// Client version presented upstream
    #[arg(long)]
    pub masquerade_version: Option<String>,
}

impl SyncArgs {
    /// Apply flags on top of the file configuration.
    pub fn apply(&self, sync: &mut SyncConfig) {
        if !self.platforms.is_empty() {
            sync.platforms.clone_from(&self.platforms);
        }
        sync.exclude_platforms.extend(self.exclude_platforms.iter().cloned());
        sync.include_server |= self.include_server;
        sync.include_cli |= self.include_cli;
        sync.include_arm |= self.include_arm;
        if !self.channels.is_empty() {
            sync.channels.clone_from(&self.channels);
        }
        if self.no_binaries {
            sync.binaries = false;
        }
        if self.no_recommended {
            sync.extensions.recommended = false;
        }
        if let Some(path) = &self.specified {
            sync.extensions.specified = true;
            sync.specified_file = Some(path.clone());
        }
        sync.extensions.all |= self.all;
        sync.prerelease |= self.prerelease;
        sync.keep_history |= self.keep_history;
        sync.force |= self.force;
        if let Some(n) = self.total_recommended {
            sync.total_recommended = n;
        }
        if let Some(n) = self.versions {
            sync.versions_per_extension = n;
        }
        if let Some(n) = self.workers {
            sync.workers = n;
        }
        if let Some(secs) = self.max_duration {
            sync.max_duration_secs = Some(secs);
        }
        if let Some(secs) = self.frequency {
            sync.frequency_secs = secs;
        }
        if let Some(v) = &self.masquerade_version {
            sync.masquerade_version.clone_from(v);
        }
    }
}

#[derive(Debug, Default, Args)]
pub struct ServeArgs {
    /// Socket address to bind
    #[arg(long, env = "VSCMIRROR_LISTEN")]
    pub listen: Option<String>,

    /// Public base URL of this mirror
    #[arg(long, env = "VSCMIRROR_URL_ROOT")]
    pub url_root: Option<String>,

    /// Where the snapshot is persisted
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Seconds between timer-driven snapshot rebuilds
    #[arg(long)]
    pub refresh_interval: Option<u64>,

    /// Treatment of malicious extensions
    #[arg(long, value_enum, ignore_case = true)]
    pub malicious_policy: Option<PolicyArg>,

    /// Directory of private extensions
    #[arg(long)]
    pub custom_extensions: Option<PathBuf>,

    /// Do not watch the store for changes
    #[arg(long)]
    pub no_watch: bool,
}

impl ServeArgs {
    /// Apply flags on top of the file configuration.
    pub fn apply(&self, gallery: &mut GalleryConfig) {
        if let Some(listen) = &self.listen {
            gallery.listen.clone_from(listen);
        }
        if let Some(root) = &self.url_root {
            gallery.url_root.clone_from(root);
        }
        if let Some(dir) = &self.cache_dir {
            gallery.cache_dir = Some(dir.clone());
        }
        if let Some(secs) = self.refresh_interval {
            gallery.refresh_interval_secs = secs;
        }
        if let Some(policy) = self.malicious_policy {
            gallery.malicious_policy = policy.into();
        }
        if let Some(dir) = &self.custom_extensions {
            gallery.custom_extensions = Some(dir.clone());
        }
        if self.no_watch {
            gallery.watch = false;
        }
    }
}

/// `--malicious-policy` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    /// Leave malicious extensions out of query results
    Exclude,
    /// Serve them, marked as malicious
    Flag,
}

impl From<PolicyArg> for MaliciousPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Exclude => Self::Exclude,
            PolicyArg::Flag => Self::Flag,
        }
    }
}

impl Cli {
    /// Load the configuration file, apply global and subcommand flags, and
    /// validate the result.
    pub fn load_config(&self) -> Result<MirrorConfig> {
        let mut config = MirrorConfig::load_or_default(self.config.as_deref())
            .context("Failed to load configuration")?;
        if let Some(root) = &self.artifacts {
            config.artifacts.clone_from(root);
        }
        match &self.command {
            Commands::Sync(args) => args.apply(&mut config.sync),
            Commands::Serve(args) => args.apply(&mut config.gallery),
            Commands::Status { .. } | Commands::Platforms { .. } => {}
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_values() {
        let cli = Cli::parse_from([
            "vscmirror",
            "--artifacts",
            "/srv/mirror",
            "sync",
            "--platforms",
            "darwin-arm64,linux-x64",
            "--include-cli",
            "--channels",
            "stable,insider",
            "--versions",
            "2",
            "--specified",
            "/etc/ext.txt",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.artifacts, PathBuf::from("/srv/mirror"));
        assert_eq!(config.sync.platforms, vec!["darwin-arm64", "linux-x64"]);
        assert!(config.sync.include_cli);
        assert_eq!(config.sync.channels, vec![Channel::Stable, Channel::Insider]);
        assert_eq!(config.sync.versions_per_extension, 2);
        assert!(config.sync.extensions.specified);
    }

    #[test]
    fn serve_flags_and_policy() {
        let cli = Cli::parse_from([
            "vscmirror",
            "serve",
            "--listen",
            "127.0.0.1:9000",
            "--malicious-policy",
            "FLAG",
            "--no-watch",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.gallery.listen, "127.0.0.1:9000");
        assert_eq!(config.gallery.malicious_policy, MaliciousPolicy::Flag);
        assert!(!config.gallery.watch);
        let err = Cli::try_parse_from(["vscmirror", "serve", "--malicious-policy", "ignore"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
        assert!(err.to_string().contains("exclude"));
    }

    #[test]
    fn invalid_values_fail_validation() {
        let cli = Cli::parse_from(["vscmirror", "sync", "--exclude-platforms", "amiga"]);
        let err = cli.load_config().unwrap_err();
        assert!(format!("{err:#}").contains("amiga"));
    }
}
