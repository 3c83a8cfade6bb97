//! Gallery engine.
//!
//! Answers the marketplace and update protocols from the metadata cache and
//! the artifact store. Every request runs `validate -> lookup -> policy ->
//! respond`; nothing here talks to upstream or writes to the store.

pub mod query;
pub mod status;
pub mod update;

use crate::cache::MetadataCache;
use crate::config::{GalleryConfig, MaliciousPolicy};
use crate::error::ErrorKind;
use crate::paths::StoreLayout;
use crate::store::StoreError;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use thiserror::Error;
use vscmirror_schema::{ExtensionQuery, IdentifierError, PlatformError, QueryResponse};

pub use query::QueryOptions;
pub use status::GalleryStatus;
pub use update::UpdateAnswer;

/// A failed gallery request. Each variant maps to one documented code.
#[derive(Error, Debug)]
pub enum GalleryError {
    /// The query body is structurally unusable.
    #[error("{0}")]
    InvalidQuery(String),

    /// An `ExtensionName` criterion is not a `publisher.name` identifier.
    #[error(transparent)]
    InvalidIdentifier(#[from] IdentifierError),

    /// Unknown platform or channel in an update path.
    #[error(transparent)]
    UnknownTarget(#[from] PlatformError),

    /// Nothing is stored for the request.
    #[error("{0} not found")]
    NotFound(String),

    /// A stored payload does not match its recorded digest.
    #[error("Payload {0} failed verification")]
    Integrity(String),

    /// Reading the store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Wire form of a [`GalleryError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
}

impl GalleryError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidQuery(_) => "invalid_query",
            Self::InvalidIdentifier(_) => "invalid_identifier",
            Self::UnknownTarget(PlatformError::UnknownPlatform(_)) => "unknown_platform",
            Self::UnknownTarget(PlatformError::UnknownChannel(_)) => "unknown_channel",
            Self::NotFound(_) => "not_found",
            Self::Integrity(_) => "integrity_error",
            Self::Store(_) => "storage_error",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidQuery(_) | Self::InvalidIdentifier(_) | Self::UnknownTarget(_) => 400,
            Self::NotFound(_) => 404,
            Self::Integrity(_) => 403,
            Self::Store(_) => 500,
        }
    }

    /// Classify the failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidQuery(_)
            | Self::InvalidIdentifier(_)
            | Self::UnknownTarget(_)
            | Self::NotFound(_) => ErrorKind::Configuration,
            Self::Integrity(_) | Self::Store(_) => ErrorKind::Storage,
        }
    }

    /// Client-facing body. Storage errors do not leak paths.
    pub fn body(&self) -> ErrorBody {
        let message = match self {
            Self::Store(_) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            code: self.code(),
            message,
        }
    }
}

/// Files served verbatim from the store root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Passthrough {
    /// `malicious.json`
    Malicious,
    /// `workspaceRecommendations.json.gz`
    Recommendations,
}

/// Read-only view over the cache and store that answers client requests.
#[derive(Debug)]
pub struct Gallery {
    cache: Arc<MetadataCache>,
    layout: StoreLayout,
    url_root: String,
    policy: MaliciousPolicy,
    verified: Mutex<HashMap<PathBuf, (SystemTime, u64)>>,
}

impl Gallery {
    /// Serve from `cache` and `layout` with the `[gallery]` options.
    pub fn new(cache: Arc<MetadataCache>, layout: StoreLayout, config: &GalleryConfig) -> Self {
        Self {
            cache,
            layout,
            url_root: config.url_root.trim_end_matches('/').to_string(),
            policy: config.malicious_policy,
            verified: Mutex::new(HashMap::new()),
        }
    }

    /// The cache this gallery reads.
    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// The store this gallery reads.
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Public base URL, without a trailing slash.
    pub fn url_root(&self) -> &str {
        &self.url_root
    }

    /// Answer an `extensionquery` against the current snapshot.
    ///
    /// # Errors
    ///
    /// [`GalleryError::InvalidQuery`] or [`GalleryError::InvalidIdentifier`]
    /// when the request does not validate.
    pub fn query(&self, request: &ExtensionQuery) -> Result<QueryResponse, GalleryError> {
        let snapshot = self.cache.current();
        let options = QueryOptions {
            url_root: &self.url_root,
            policy: self.policy,
        };
        let response = query::execute(&snapshot, request, &options)?;
        tracing::debug!(
            generation = snapshot.generation,
            results = response.results.len(),
            "Answered extension query"
        );
        Ok(response)
    }

    /// Bytes of a passthrough file.
    ///
    /// # Errors
    ///
    /// [`GalleryError::NotFound`] if the sync engine has not produced it yet.
    pub async fn passthrough(&self, which: Passthrough) -> Result<Vec<u8>, GalleryError> {
        let path = match which {
            Passthrough::Malicious => self.layout.malicious(),
            Passthrough::Recommendations => self.layout.recommendations(),
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(GalleryError::NotFound(
                path.file_name()
                    .map_or_else(String::new, |n| n.to_string_lossy().into_owned()),
            )),
            Err(e) => Err(StoreError::io(path, e).into()),
        }
    }

    /// Resolve `/artifacts/<relative>` to a file in the store.
    ///
    /// # Errors
    ///
    /// [`GalleryError::NotFound`] for anything that is not a regular file
    /// strictly inside the store, hidden files included.
    pub fn artifact_path(&self, relative: &str) -> Result<PathBuf, GalleryError> {
        resolve_static(self.layout.root(), relative)
    }

    /// Resolve `/custom-extensions/<relative>` to a file in the custom tree.
    ///
    /// # Errors
    ///
    /// As [`Gallery::artifact_path`].
    pub fn custom_path(&self, relative: &str) -> Result<PathBuf, GalleryError> {
        resolve_static(self.layout.custom_extensions(), relative)
    }
}

/// Join `relative` onto `root`, refusing anything that could leave it.
///
/// # Errors
///
/// [`GalleryError::NotFound`] for traversal attempts, hidden segments and
/// paths that are not regular files.
pub fn resolve_static(root: &Path, relative: &str) -> Result<PathBuf, GalleryError> {
    let not_found = || GalleryError::NotFound(relative.to_string());
    let rel = Path::new(relative.trim_start_matches('/'));
    let mut path = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(segment) => {
                if segment.to_str().is_none_or(|s| s.starts_with('.')) {
                    return Err(not_found());
                }
                path.push(segment);
            }
            Component::CurDir => {}
            _ => return Err(not_found()),
        }
    }
    if path == root || !path.is_file() {
        return Err(not_found());
    }
    Ok(path)
}
