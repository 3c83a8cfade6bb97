//! Target platform catalog.
//!
//! Every binary the mirror fetches is addressed by a [`Platform`] and a
//! [`Channel`]. The catalog is static: upstream decides which platform ids
//! exist, and an id that is not in [`Platform::catalog`] is a configuration
//! error rather than something to pass through.
//!
//! # Example
//!
//! ```
//! use vscmirror_schema::{Category, Platform};
//!
//! let p = Platform::lookup("server-linux-arm64").unwrap();
//! assert_eq!(p.category, Category::Server);
//! assert!(p.is_arm());
//! assert_eq!(p.extension_targets, &["linux-arm64"]);
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced when a platform or channel token cannot be resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The token is not one of the catalog identifiers.
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    /// The token is neither `stable` nor `insider`.
    #[error("Unknown channel: {0} (expected 'stable' or 'insider')")]
    UnknownChannel(String),
}

/// Which product family a platform build belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Desktop editor installers and archives.
    Desktop,
    /// Remote-development server builds.
    Server,
    /// Standalone command-line builds.
    Cli,
}

impl Category {
    /// Lowercase name as used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Server => "server",
            Self::Cli => "cli",
        }
    }
}

/// Operating system family of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    /// Microsoft Windows.
    Windows,
    /// Glibc-based Linux distributions.
    Linux,
    /// musl-based Alpine Linux.
    Alpine,
    /// Apple macOS.
    Darwin,
}

impl Os {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::Alpine => "alpine",
            Self::Darwin => "darwin",
        }
    }
}

/// CPU architecture of a platform.
///
/// Platforms whose upstream id carries no architecture suffix (e.g. `win32`,
/// `server-linux`) are the historical x64 builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 64-bit x86.
    X64,
    /// 64-bit ARM.
    Arm64,
    /// 32-bit ARM hard-float.
    Armhf,
    /// Fat binary covering both x64 and arm64 (macOS only).
    Universal,
}

impl Arch {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X64 => "x64",
            Self::Arm64 => "arm64",
            Self::Armhf => "armhf",
            Self::Universal => "universal",
        }
    }

    /// Whether this is one of the ARM architectures gated by `include_arm`.
    pub fn is_arm(&self) -> bool {
        matches!(self, Self::Arm64 | Self::Armhf)
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A target platform descriptor.
///
/// Descriptors are immutable and live for the whole process; code passes
/// `&'static Platform` around and compares by id.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Platform {
    /// Upstream identifier used in update URLs (e.g. `linux-x64`).
    pub id: &'static str,
    /// Operating system family.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
    /// Product family.
    pub category: Category,
    /// Extension `targetPlatform` values whose platform-specific builds run
    /// here. Empty for CLI builds, which do not host extensions.
    pub extension_targets: &'static [&'static str],
}

macro_rules! platform {
    ($id:literal, $os:ident, $arch:ident, $cat:ident, [$($t:literal),*]) => {
        Platform {
            id: $id,
            os: Os::$os,
            arch: Arch::$arch,
            category: Category::$cat,
            extension_targets: &[$($t),*],
        }
    };
}

static CATALOG: &[Platform] = &[
    // Desktop Windows
    platform!("win32", Windows, X64, Desktop, ["win32-x64"]),
    platform!("win32-x64", Windows, X64, Desktop, ["win32-x64"]),
    platform!("win32-arm64", Windows, Arm64, Desktop, ["win32-arm64"]),
    // Desktop Linux
    platform!("linux", Linux, X64, Desktop, ["linux-x64"]),
    platform!("linux-x64", Linux, X64, Desktop, ["linux-x64"]),
    platform!("linux-arm64", Linux, Arm64, Desktop, ["linux-arm64"]),
    platform!("linux-armhf", Linux, Armhf, Desktop, ["linux-armhf"]),
    platform!("linux-deb", Linux, X64, Desktop, ["linux-x64"]),
    platform!("linux-rpm", Linux, X64, Desktop, ["linux-x64"]),
    platform!("linux-snap", Linux, X64, Desktop, ["linux-x64"]),
    // Desktop macOS
    platform!("darwin", Darwin, X64, Desktop, ["darwin-x64"]),
    platform!("darwin-x64", Darwin, X64, Desktop, ["darwin-x64"]),
    platform!("darwin-arm64", Darwin, Arm64, Desktop, ["darwin-arm64"]),
    platform!("darwin-universal", Darwin, Universal, Desktop, ["darwin-x64", "darwin-arm64"]),
    // Remote development servers
    platform!("server-linux", Linux, X64, Server, ["linux-x64"]),
    platform!("server-linux-x64", Linux, X64, Server, ["linux-x64"]),
    platform!("server-linux-arm64", Linux, Arm64, Server, ["linux-arm64"]),
    platform!("server-linux-armhf", Linux, Armhf, Server, ["linux-armhf"]),
    platform!("server-darwin", Darwin, X64, Server, ["darwin-x64"]),
    platform!("server-darwin-x64", Darwin, X64, Server, ["darwin-x64"]),
    platform!("server-darwin-arm64", Darwin, Arm64, Server, ["darwin-arm64"]),
    platform!("server-win32", Windows, X64, Server, ["win32-x64"]),
    platform!("server-win32-x64", Windows, X64, Server, ["win32-x64"]),
    platform!("server-win32-arm64", Windows, Arm64, Server, ["win32-arm64"]),
    // Standalone CLI
    platform!("cli-linux", Linux, X64, Cli, []),
    platform!("cli-linux-x64", Linux, X64, Cli, []),
    platform!("cli-linux-arm64", Linux, Arm64, Cli, []),
    platform!("cli-darwin", Darwin, X64, Cli, []),
    platform!("cli-darwin-x64", Darwin, X64, Cli, []),
    platform!("cli-darwin-arm64", Darwin, Arm64, Cli, []),
    platform!("cli-win32", Windows, X64, Cli, []),
    platform!("cli-win32-x64", Windows, X64, Cli, []),
    platform!("cli-win32-arm64", Windows, Arm64, Cli, []),
    platform!("cli-alpine", Alpine, X64, Cli, []),
];

impl Platform {
    /// All platforms known to the mirror, in catalog order.
    pub fn catalog() -> &'static [Platform] {
        CATALOG
    }

    /// Resolve a platform token (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::UnknownPlatform`] if the token is not in the catalog.
    pub fn lookup(id: &str) -> Result<&'static Platform, PlatformError> {
        let wanted = id.trim();
        CATALOG
            .iter()
            .find(|p| p.id.eq_ignore_ascii_case(wanted))
            .ok_or_else(|| PlatformError::UnknownPlatform(id.to_string()))
    }

    /// Whether the platform is gated by the `include_arm` toggle.
    pub fn is_arm(&self) -> bool {
        self.arch.is_arm()
    }

    /// Whether an extension build for `target` can run on this platform.
    pub fn hosts_extension_target(&self, target: &str) -> bool {
        self.extension_targets
            .iter()
            .any(|t| t.eq_ignore_ascii_case(target))
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id)
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id)
    }
}

impl<'de> Deserialize<'de> for &'static Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Platform::lookup(&s).map_err(serde::de::Error::custom)
    }
}

/// Release track.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Monthly stable releases.
    #[default]
    Stable,
    /// Nightly builds.
    Insider,
}

impl Channel {
    /// Both channels, stable first.
    pub const ALL: [Channel; 2] = [Channel::Stable, Channel::Insider];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Insider => "insider",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stable" => Ok(Self::Stable),
            "insider" | "insiders" => Ok(Self::Insider),
            _ => Err(PlatformError::UnknownChannel(s.to_string())),
        }
    }
}
