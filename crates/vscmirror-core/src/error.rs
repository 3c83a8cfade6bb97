//! Error classification shared by every module.
//!
//! Each module owns a `thiserror` enum; [`MirrorError`] wraps them all and
//! [`ErrorKind`] is the coarse class callers branch on (retry, abort, report).

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::gallery::GalleryError;
use crate::io::fetch::FetchError;
use crate::store::StoreError;
use crate::sync::SyncError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection reset, timeout, 5xx. Retried.
    TransientNetwork,
    /// HTTP 429. Retried after the advertised delay.
    RateLimited,
    /// Upstream answered with something unusable. Not retried.
    UpstreamProtocol,
    /// Bad configuration or client input. Fatal to startup.
    Configuration,
    /// Local disk failure. Fatal to the owning process.
    Storage,
    /// Snapshot could not be built or loaded.
    CacheBuild,
}

impl ErrorKind {
    /// Whether the fetch client should try again.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientNetwork | Self::RateLimited)
    }

    /// Whether the owning run must stop.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Storage | Self::Configuration)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::TransientNetwork => "transient network failure",
            Self::RateLimited => "rate limited",
            Self::UpstreamProtocol => "upstream protocol error",
            Self::Configuration => "configuration error",
            Self::Storage => "storage error",
            Self::CacheBuild => "cache build error",
        })
    }
}

/// Any error produced by this crate.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Upstream transport failure.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Artifact store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Snapshot failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Gallery request failure.
    #[error(transparent)]
    Gallery(#[from] GalleryError),

    /// Sync run failure.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl MirrorError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Store(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Cache(e) => e.kind(),
            Self::Gallery(e) => e.kind(),
            Self::Sync(e) => e.kind(),
        }
    }
}
