//! Core library for vscmirror.
//!
//! The sync engine ([`sync`]) pulls installers and extensions from upstream
//! into an [`ArtifactStore`]; the [`cache::MetadataCache`] projects that store
//! into immutable snapshots; the [`gallery`] answers client protocol requests
//! from those snapshots. The two halves share nothing but the filesystem.

pub mod cache;
pub mod config;
pub mod error;
pub mod gallery;
pub mod io;
pub mod paths;
pub mod reporter;
pub mod store;
pub mod sync;

pub use config::{ConfigError, MirrorConfig};
pub use error::{ErrorKind, MirrorError};
pub use paths::StoreLayout;
pub use reporter::{NullReporter, Reporter, TracingReporter};
pub use store::ArtifactStore;

/// Version of this build, reported by the status surface.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
