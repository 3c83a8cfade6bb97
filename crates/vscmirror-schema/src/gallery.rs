//! Marketplace `extensionquery` wire format.
//!
//! These types are both what the sync engine receives from upstream and what
//! the gallery answers with, so every struct keeps unknown fields in a
//! flattened `extra` map and writes them back out untouched. Upstream adds
//! fields regularly and clients expect them to survive the round trip.

use crate::ident::{ExtensionId, IdentifierError};
use crate::PRERELEASE_PROPERTY;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn is_false(b: &bool) -> bool {
    !*b
}

/// Publisher block of an extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GalleryPublisher {
    /// Marketplace GUID of the publisher.
    #[serde(default)]
    pub publisher_id: String,
    /// Publisher handle (the half before the dot in an identifier).
    pub publisher_name: String,
    /// Human-readable publisher name.
    #[serde(default)]
    pub display_name: String,
    /// Fields this mirror does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One downloadable asset of a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryFile {
    /// Asset type, e.g. `Microsoft.VisualStudio.Services.VSIXPackage`.
    pub asset_type: String,
    /// Download URL. Rewritten to the mirror's own URL when served.
    #[serde(default)]
    pub source: String,
    /// Fields this mirror does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Key/value property attached to a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// Property name.
    pub key: String,
    /// Property value, always a string on the wire.
    pub value: String,
}

/// A named aggregate statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistic {
    /// Statistic name (`install`, `averagerating`, `weightedRating`, ...).
    pub statistic_name: String,
    /// Statistic value.
    pub value: f64,
}

/// A single published build of an extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryVersion {
    /// Version string as published. Not guaranteed to be valid semver.
    pub version: String,
    /// Target platform (`linux-x64`, ...). Absent for universal builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_platform: Option<String>,
    /// Upstream flag string.
    #[serde(default)]
    pub flags: String,
    /// Publication timestamp. Authoritative for ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Downloadable assets.
    #[serde(default)]
    pub files: Vec<GalleryFile>,
    /// Version properties (engine constraints, prerelease marker, ...).
    #[serde(default)]
    pub properties: Vec<Property>,
    /// Base URI of the version's assets.
    #[serde(default)]
    pub asset_uri: String,
    /// Fallback base URI.
    #[serde(default)]
    pub fallback_asset_uri: String,
    /// Fields this mirror does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GalleryVersion {
    /// Look up a version property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    /// Whether this build is marked as a prerelease.
    pub fn is_prerelease(&self) -> bool {
        self.property(PRERELEASE_PROPERTY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Whether this build runs on every platform.
    pub fn is_universal(&self) -> bool {
        match self.target_platform.as_deref() {
            None | Some("" | "universal") => true,
            Some(_) => false,
        }
    }

    /// The asset of the given type, if present.
    pub fn file(&self, asset_type: &str) -> Option<&GalleryFile> {
        self.files.iter().find(|f| f.asset_type == asset_type)
    }

    /// Relative directory for this build under the extension directory:
    /// `<version>` or `<version>/<target>`.
    pub fn relative_dir(&self) -> String {
        match self.target_platform.as_deref() {
            Some(t) if !self.is_universal() => format!("{}/{t}", self.version),
            _ => self.version.clone(),
        }
    }

    /// Point `assetUri`, `fallbackAssetUri` and every file `source` at `base`.
    pub fn rebase_assets(&mut self, base: &str) {
        let base = base.trim_end_matches('/');
        self.asset_uri = base.to_string();
        self.fallback_asset_uri = base.to_string();
        for file in &mut self.files {
            file.source = format!("{base}/{}", file.asset_type);
        }
    }
}

/// An extension as described by the marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryExtension {
    /// Publisher block.
    pub publisher: GalleryPublisher,
    /// Marketplace GUID.
    #[serde(default)]
    pub extension_id: String,
    /// Name half of the identifier.
    pub extension_name: String,
    /// Human-readable name.
    #[serde(default)]
    pub display_name: String,
    /// One-line description.
    #[serde(default)]
    pub short_description: String,
    /// Upstream flag string (`validated, public`, ...).
    #[serde(default)]
    pub flags: String,
    /// Last update of any version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// First publication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<DateTime<Utc>>,
    /// Release date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<DateTime<Utc>>,
    /// Known versions, newest first.
    #[serde(default)]
    pub versions: Vec<GalleryVersion>,
    /// Marketplace categories.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Marketplace tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Aggregate statistics.
    #[serde(default)]
    pub statistics: Vec<Statistic>,
    /// Set by the sync engine when the extension came from the
    /// recommendations source. Drives the empty-search fallback.
    #[serde(default, skip_serializing_if = "is_false")]
    pub recommended: bool,
    /// Fields this mirror does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GalleryExtension {
    /// The validated `publisher.name` identifier.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentifierError`] if upstream sent a name that would not
    /// survive as a directory name.
    pub fn identifier(&self) -> Result<ExtensionId, IdentifierError> {
        ExtensionId::from_parts(&self.publisher.publisher_name, &self.extension_name)
    }

    /// Value of a named statistic, `0.0` when absent.
    pub fn statistic(&self, name: &str) -> f64 {
        self.statistics
            .iter()
            .find(|s| s.statistic_name == name)
            .map_or(0.0, |s| s.value)
    }

    /// Install count.
    pub fn install_count(&self) -> f64 {
        self.statistic("install")
    }

    /// Average rating.
    pub fn average_rating(&self) -> f64 {
        self.statistic("averagerating")
    }

    /// Weighted rating.
    pub fn weighted_rating(&self) -> f64 {
        self.statistic("weightedRating")
    }

    /// Append a flag word to the comma-separated flag string.
    pub fn add_flag(&mut self, flag: &str) {
        if self.flags.split(',').any(|f| f.trim() == flag) {
            return;
        }
        if self.flags.trim().is_empty() {
            self.flags = flag.to_string();
        } else {
            self.flags = format!("{}, {flag}", self.flags);
        }
    }
}

/// Bit set of `IncludeX` query flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryFlags(pub u32);

impl QueryFlags {
    /// No flags.
    pub const NONE: Self = Self(0x0);
    /// Include all versions.
    pub const INCLUDE_VERSIONS: Self = Self(0x1);
    /// Include file lists.
    pub const INCLUDE_FILES: Self = Self(0x2);
    /// Include categories and tags.
    pub const INCLUDE_CATEGORY_AND_TAGS: Self = Self(0x4);
    /// Include shared accounts.
    pub const INCLUDE_SHARED_ACCOUNTS: Self = Self(0x8);
    /// Include version properties.
    pub const INCLUDE_VERSION_PROPERTIES: Self = Self(0x10);
    /// Exclude unvalidated extensions.
    pub const EXCLUDE_NON_VALIDATED: Self = Self(0x20);
    /// Include installation targets.
    pub const INCLUDE_INSTALLATION_TARGETS: Self = Self(0x40);
    /// Include asset URIs.
    pub const INCLUDE_ASSET_URI: Self = Self(0x80);
    /// Include statistics.
    pub const INCLUDE_STATISTICS: Self = Self(0x100);
    /// Only the latest version per extension (and per target platform).
    pub const INCLUDE_LATEST_VERSION_ONLY: Self = Self(0x200);
    /// Include unpublished extensions.
    pub const UNPUBLISHED: Self = Self(0x1000);

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for QueryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Criterion kinds understood by the gallery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    /// Tag match.
    Tag,
    /// Marketplace GUID.
    ExtensionId,
    /// Category match.
    Category,
    /// `publisher.name` identifier.
    ExtensionName,
    /// Target product (`Microsoft.VisualStudio.Code`).
    Target,
    /// Featured listing.
    Featured,
    /// Free-text search.
    SearchText,
    /// Exclude extensions carrying these flag bits.
    ExcludeWithFlags,
}

impl FilterType {
    /// Decode a wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Tag),
            4 => Some(Self::ExtensionId),
            5 => Some(Self::Category),
            7 => Some(Self::ExtensionName),
            8 => Some(Self::Target),
            9 => Some(Self::Featured),
            10 => Some(Self::SearchText),
            12 => Some(Self::ExcludeWithFlags),
            _ => None,
        }
    }

    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            Self::Tag => 1,
            Self::ExtensionId => 4,
            Self::Category => 5,
            Self::ExtensionName => 7,
            Self::Target => 8,
            Self::Featured => 9,
            Self::SearchText => 10,
            Self::ExcludeWithFlags => 12,
        }
    }
}

/// Sort keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortBy {
    /// Relevance; served as install count descending.
    #[default]
    Relevance,
    /// Last update date.
    LastUpdated,
    /// Display name.
    Title,
    /// Publisher name.
    PublisherName,
    /// Install count.
    InstallCount,
    /// First publication date.
    PublishedDate,
    /// Average rating.
    AverageRating,
    /// Weighted rating.
    WeightedRating,
}

impl SortBy {
    /// Decode a wire code. Unknown codes sort by relevance.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::LastUpdated,
            2 => Self::Title,
            3 => Self::PublisherName,
            4 => Self::InstallCount,
            5 => Self::PublishedDate,
            6 => Self::AverageRating,
            12 => Self::WeightedRating,
            _ => Self::Relevance,
        }
    }

    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            Self::Relevance => 0,
            Self::LastUpdated => 1,
            Self::Title => 2,
            Self::PublisherName => 3,
            Self::InstallCount => 4,
            Self::PublishedDate => 5,
            Self::AverageRating => 6,
            Self::WeightedRating => 12,
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortOrder {
    /// Key-specific default.
    #[default]
    Default,
    /// Ascending.
    Ascending,
    /// Descending.
    Descending,
}

impl SortOrder {
    /// Decode a wire code. Unknown codes use the default.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Ascending,
            2 => Self::Descending,
            _ => Self::Default,
        }
    }

    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            Self::Default => 0,
            Self::Ascending => 1,
            Self::Descending => 2,
        }
    }
}

/// One filter criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    /// Raw filter type code.
    pub filter_type: u32,
    /// Criterion value. Missing for some flag-only criteria.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Criterion {
    /// Build a criterion from a known kind.
    pub fn new(kind: FilterType, value: impl Into<String>) -> Self {
        Self {
            filter_type: kind.code(),
            value: Some(value.into()),
        }
    }

    /// Decoded filter kind, `None` for codes this mirror does not know.
    pub fn kind(&self) -> Option<FilterType> {
        FilterType::from_code(self.filter_type)
    }
}

fn default_page_number() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

/// One filter of a query: criteria plus paging and sort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilter {
    /// Criteria, combined as described on the gallery query.
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    /// 1-based page number.
    #[serde(default = "default_page_number")]
    pub page_number: u32,
    /// Page size.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Raw sort key code.
    #[serde(default)]
    pub sort_by: u32,
    /// Raw sort order code.
    #[serde(default)]
    pub sort_order: u32,
}

impl QueryFilter {
    /// Decoded sort key.
    pub fn sort_by(&self) -> SortBy {
        SortBy::from_code(self.sort_by)
    }

    /// Decoded sort order.
    pub fn sort_order(&self) -> SortOrder {
        SortOrder::from_code(self.sort_order)
    }
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            criteria: Vec::new(),
            page_number: default_page_number(),
            page_size: default_page_size(),
            sort_by: 0,
            sort_order: 0,
        }
    }
}

/// Body of a `POST /_apis/public/gallery/extensionquery`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionQuery {
    /// Filters. Clients send exactly one in practice.
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    /// Requested asset types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_types: Vec<String>,
    /// Flag bits.
    #[serde(default)]
    pub flags: QueryFlags,
}

/// One count entry of the result metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    /// Entry name (`TotalCount`, ...).
    pub name: String,
    /// Entry count.
    pub count: u64,
}

/// A typed group of metadata items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    /// Metadata type (`ResultCount`, ...).
    pub metadata_type: String,
    /// Items of this type.
    pub metadata_items: Vec<MetadataItem>,
}

/// Results for one filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Matching extensions for the requested page.
    #[serde(default)]
    pub extensions: Vec<GalleryExtension>,
    /// Always `null` from this mirror.
    #[serde(default)]
    pub paging_token: Option<String>,
    /// Result metadata.
    #[serde(default)]
    pub result_metadata: Vec<ResultMetadata>,
}

impl QueryResult {
    /// Result for one page, reporting `total` matches overall.
    pub fn page(extensions: Vec<GalleryExtension>, total: u64) -> Self {
        Self {
            extensions,
            paging_token: None,
            result_metadata: vec![ResultMetadata {
                metadata_type: "ResultCount".to_string(),
                metadata_items: vec![MetadataItem {
                    name: "TotalCount".to_string(),
                    count: total,
                }],
            }],
        }
    }

    /// Value of the `ResultCount/TotalCount` item.
    pub fn total_count(&self) -> Option<u64> {
        self.result_metadata
            .iter()
            .filter(|m| m.metadata_type == "ResultCount")
            .flat_map(|m| &m.metadata_items)
            .find(|i| i.name == "TotalCount")
            .map(|i| i.count)
    }
}

/// Response of an extension query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QueryResponse {
    /// One result per filter.
    #[serde(default)]
    pub results: Vec<QueryResult>,
}
