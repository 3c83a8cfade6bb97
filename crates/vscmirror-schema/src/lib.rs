//! Shared types and wire format for vscmirror.
//!
//! Everything in this crate is consumed by both the sync engine (producer of
//! the artifact store) and the gallery engine (consumer), so the shapes here
//! double as the on-disk contract.

pub mod binary;
pub mod gallery;
pub mod hash;
pub mod ident;
pub mod malicious;
pub mod platform;
pub mod version;

// Re-exports
pub use binary::{BinaryRecord, UpdateInfo};
pub use gallery::{
    Criterion, ExtensionQuery, FilterType, GalleryExtension, GalleryFile, GalleryPublisher,
    GalleryVersion, QueryFilter, QueryFlags, QueryResponse, QueryResult, SortBy, SortOrder,
};
pub use hash::*;
pub use ident::{ExtensionId, IdentifierError};
pub use malicious::MaliciousList;
pub use platform::{Arch, Category, Channel, Os, Platform, PlatformError};

/// Magic bytes for ZSTD compression (Little Endian: 0xFD2FB528 -> 28 B5 2F FD)
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Target product queried in marketplace `Target` criteria.
pub const MARKETPLACE_TARGET: &str = "Microsoft.VisualStudio.Code";

/// Version property marking a prerelease build.
pub const PRERELEASE_PROPERTY: &str = "Microsoft.VisualStudio.Code.PreRelease";
