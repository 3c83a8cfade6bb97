//! `extensionquery` evaluation.
//!
//! Within one filter, lookup criteria (`ExtensionId`, `ExtensionName`,
//! `SearchText`) are alternatives and their matches are unioned. `Tag` and
//! `Category` criteria narrow the result, as do a target-platform `Target`
//! value and `ExcludeWithFlags`. A filter with no lookup, tag or category
//! criterion is an empty search and returns the recommended extensions.

use crate::cache::{CacheSnapshot, EntrySource, ExtensionEntry};
use crate::config::MaliciousPolicy;
use crate::gallery::GalleryError;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use vscmirror_schema::version::latest_per_target;
use vscmirror_schema::{
    Criterion, ExtensionId, ExtensionQuery, FilterType, GalleryExtension, MARKETPLACE_TARGET,
    QueryFilter, QueryFlags, QueryResponse, QueryResult, SortBy, SortOrder,
};

/// Largest page a client may ask for.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Flag word added to malicious extensions under [`MaliciousPolicy::Flag`].
pub const MALICIOUS_FLAG: &str = "malicious";

/// Per-request settings.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions<'a> {
    /// Public base URL for rewritten asset URIs.
    pub url_root: &'a str,
    /// Treatment of malicious extensions.
    pub policy: MaliciousPolicy,
}

/// Criteria of one filter, decoded and validated.
#[derive(Debug, Default)]
struct Criteria {
    guids: Vec<String>,
    names: Vec<ExtensionId>,
    texts: Vec<String>,
    tags: Vec<String>,
    categories: Vec<String>,
    target_platforms: Vec<String>,
    exclude_flags: QueryFlags,
}

impl Criteria {
    fn parse(filter: &QueryFilter) -> Result<Self, GalleryError> {
        let mut out = Self::default();
        for criterion in &filter.criteria {
            let Some(kind) = criterion.kind() else {
                tracing::debug!(filter_type = criterion.filter_type, "Ignoring unknown criterion");
                continue;
            };
            let value = criterion.value.as_deref().map(str::trim);
            match kind {
                FilterType::ExtensionId => out.guids.push(required(criterion, value)?.to_lowercase()),
                FilterType::ExtensionName => {
                    out.names.push(ExtensionId::parse(required(criterion, value)?)?);
                }
                FilterType::SearchText => {
                    if let Some(text) = value.filter(|v| !v.is_empty()) {
                        out.texts.push(text.to_lowercase());
                    }
                }
                FilterType::Tag => out.tags.push(required(criterion, value)?.to_lowercase()),
                FilterType::Category => {
                    out.categories.push(required(criterion, value)?.to_lowercase());
                }
                FilterType::Target => {
                    if let Some(target) =
                        value.filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case(MARKETPLACE_TARGET))
                    {
                        out.target_platforms.push(target.to_lowercase());
                    }
                }
                FilterType::ExcludeWithFlags => {
                    let bits = value.unwrap_or("0").parse::<u32>().map_err(|_| {
                        GalleryError::InvalidQuery(format!(
                            "ExcludeWithFlags value {value:?} is not a number"
                        ))
                    })?;
                    out.exclude_flags = out.exclude_flags | QueryFlags(bits);
                }
                FilterType::Featured => {}
            }
        }
        Ok(out)
    }

    fn has_lookup(&self) -> bool {
        !(self.guids.is_empty() && self.names.is_empty() && self.texts.is_empty())
    }

    fn is_empty_search(&self) -> bool {
        !self.has_lookup() && self.tags.is_empty() && self.categories.is_empty()
    }

    fn looked_up(&self, id: &ExtensionId, ext: &GalleryExtension) -> bool {
        self.guids.iter().any(|g| ext.extension_id.eq_ignore_ascii_case(g))
            || self.names.contains(id)
            || self.texts.iter().any(|t| matches_text(id, ext, t))
    }

    fn narrows_to(&self, ext: &GalleryExtension) -> bool {
        let has = |wanted: &[String], have: &[String]| {
            wanted
                .iter()
                .all(|w| have.iter().any(|h| h.eq_ignore_ascii_case(w)))
        };
        has(&self.tags, &ext.tags)
            && has(&self.categories, &ext.categories)
            && !(self.exclude_flags.contains(QueryFlags::UNPUBLISHED) && has_flag(ext, "unpublished"))
    }
}

fn required<'a>(criterion: &Criterion, value: Option<&'a str>) -> Result<&'a str, GalleryError> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| {
        GalleryError::InvalidQuery(format!(
            "criterion with filterType {} requires a value",
            criterion.filter_type
        ))
    })
}

fn has_flag(ext: &GalleryExtension, flag: &str) -> bool {
    ext.flags.split(',').any(|f| f.trim().eq_ignore_ascii_case(flag))
}

fn matches_text(id: &ExtensionId, ext: &GalleryExtension, needle: &str) -> bool {
    id.as_str().contains(needle)
        || [
            &ext.display_name,
            &ext.short_description,
            &ext.publisher.publisher_name,
            &ext.publisher.display_name,
        ]
        .iter()
        .any(|field| field.to_lowercase().contains(needle))
}

/// Check the request shape before anything is looked up.
fn validate(query: &ExtensionQuery) -> Result<(), GalleryError> {
    if query.filters.is_empty() {
        return Err(GalleryError::InvalidQuery(
            "at least one filter is required".to_string(),
        ));
    }
    for filter in &query.filters {
        if filter.criteria.is_empty() {
            return Err(GalleryError::InvalidQuery(
                "every filter needs at least one criterion".to_string(),
            ));
        }
        if filter.page_number == 0 {
            return Err(GalleryError::InvalidQuery("pageNumber starts at 1".to_string()));
        }
        if filter.page_size == 0 || filter.page_size > MAX_PAGE_SIZE {
            return Err(GalleryError::InvalidQuery(format!(
                "pageSize must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
    }
    Ok(())
}

/// Evaluate `query` against `snapshot`.
///
/// # Errors
///
/// Validation failures, before any lookup happens.
pub fn execute(
    snapshot: &CacheSnapshot,
    query: &ExtensionQuery,
    options: &QueryOptions<'_>,
) -> Result<QueryResponse, GalleryError> {
    validate(query)?;
    let parsed = query
        .filters
        .iter()
        .map(Criteria::parse)
        .collect::<Result<Vec<_>, _>>()?;

    let results = query
        .filters
        .iter()
        .zip(&parsed)
        .map(|(filter, criteria)| run_filter(snapshot, filter, criteria, query.flags, options))
        .collect();
    Ok(QueryResponse { results })
}

fn run_filter(
    snapshot: &CacheSnapshot,
    filter: &QueryFilter,
    criteria: &Criteria,
    flags: QueryFlags,
    options: &QueryOptions<'_>,
) -> QueryResult {
    let empty_search = criteria.is_empty_search();
    let mut matched: Vec<(&ExtensionId, &ExtensionEntry)> = snapshot
        .extensions
        .iter()
        .filter(|(id, entry)| {
            let ext = &entry.extension;
            let selected = if empty_search {
                ext.recommended
            } else {
                !criteria.has_lookup() || criteria.looked_up(id, ext)
            };
            selected && criteria.narrows_to(ext)
        })
        .filter(|(id, _)| {
            options.policy == MaliciousPolicy::Flag || !snapshot.malicious.contains(id)
        })
        .collect();

    sort(&mut matched, filter.sort_by(), filter.sort_order());

    let mut extensions = Vec::new();
    let mut total = 0u64;
    let skip = (filter.page_number as usize - 1) * filter.page_size as usize;
    for (id, entry) in matched {
        let Some(ext) = project(id, entry, criteria, flags, snapshot, options) else {
            continue;
        };
        if total as usize >= skip && extensions.len() < filter.page_size as usize {
            extensions.push(ext);
        }
        total += 1;
    }
    QueryResult::page(extensions, total)
}

/// The response form of one entry, or `None` if no build survives the
/// target-platform criteria.
fn project(
    id: &ExtensionId,
    entry: &ExtensionEntry,
    criteria: &Criteria,
    flags: QueryFlags,
    snapshot: &CacheSnapshot,
    options: &QueryOptions<'_>,
) -> Option<GalleryExtension> {
    let mut ext = entry.extension.clone();
    if !criteria.target_platforms.is_empty() {
        ext.versions.retain(|v| {
            v.is_universal()
                || v.target_platform
                    .as_deref()
                    .is_some_and(|t| criteria.target_platforms.iter().any(|w| w.eq_ignore_ascii_case(t)))
        });
        if ext.versions.is_empty() {
            return None;
        }
    }
    if flags.contains(QueryFlags::INCLUDE_LATEST_VERSION_ONLY) {
        ext.versions = latest_per_target(&ext.versions).into_iter().cloned().collect();
    }

    let base = match entry.source {
        EntrySource::Mirrored => format!("{}/artifacts/extensions/{id}", options.url_root),
        EntrySource::Custom => format!("{}/custom-extensions/{id}", options.url_root),
    };
    for version in &mut ext.versions {
        let dir = version.relative_dir();
        version.rebase_assets(&format!("{base}/{dir}"));
    }

    if snapshot.malicious.contains(id) {
        ext.add_flag(MALICIOUS_FLAG);
    }
    Some(ext)
}

fn sort(matched: &mut [(&ExtensionId, &ExtensionEntry)], by: SortBy, order: SortOrder) {
    let ascending_by_default = matches!(by, SortBy::Title | SortBy::PublisherName);
    let ascending = match order {
        SortOrder::Ascending => true,
        SortOrder::Descending => false,
        SortOrder::Default => ascending_by_default,
    };
    let number = |a: f64, b: f64| a.partial_cmp(&b).unwrap_or(Ordering::Equal);

    matched.sort_by(|(ia, a), (ib, b)| {
        let (a, b) = (&a.extension, &b.extension);
        let key = match by {
            SortBy::Relevance | SortBy::InstallCount => number(a.install_count(), b.install_count()),
            SortBy::AverageRating => number(a.average_rating(), b.average_rating()),
            SortBy::WeightedRating => number(a.weighted_rating(), b.weighted_rating()),
            SortBy::LastUpdated => a.last_updated.cmp(&b.last_updated),
            SortBy::PublishedDate => a.published_date.cmp(&b.published_date),
            SortBy::Title => title(a).cmp(&title(b)),
            SortBy::PublisherName => a
                .publisher
                .publisher_name
                .to_lowercase()
                .cmp(&b.publisher.publisher_name.to_lowercase()),
        };
        let key = if ascending { key } else { key.reverse() };
        key.then_with(|| ia.cmp(ib))
    });
}

fn title(ext: &GalleryExtension) -> String {
    if ext.display_name.is_empty() {
        ext.extension_name.to_lowercase()
    } else {
        ext.display_name.to_lowercase()
    }
}

/// Recommended entries an empty search would return under `policy`.
pub fn recommended_ids(snapshot: &CacheSnapshot, policy: MaliciousPolicy) -> BTreeSet<&ExtensionId> {
    snapshot
        .extensions
        .iter()
        .filter(|(id, e)| {
            e.extension.recommended
                && (policy == MaliciousPolicy::Flag || !snapshot.malicious.contains(id))
        })
        .map(|(id, _)| id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::{write_extension, write_extension_with};
    use crate::paths::StoreLayout;
    use tempfile::TempDir;

    const ROOT: &str = "http://mirror:8080";

    fn options(policy: MaliciousPolicy) -> QueryOptions<'static> {
        QueryOptions {
            url_root: ROOT,
            policy,
        }
    }

    fn fixture() -> (TempDir, CacheSnapshot) {
        let dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(dir.path());
        let ext = layout.extensions();
        write_extension_with(
            &ext,
            "ms-python.python",
            &[("2024.1.0", "2024-01-10T00:00:00Z")],
            serde_json::json!({
                "displayName": "Python",
                "shortDescription": "Linting, debugging",
                "statistics": [{"statisticName": "install", "value": 900.0}],
                "tags": ["python"],
                "recommended": true,
            }),
        );
        write_extension_with(
            &ext,
            "acme.lint",
            &[("1.10.0", "2024-01-01T00:00:00Z"), ("1.9.0", "2024-03-01T00:00:00Z")],
            serde_json::json!({
                "displayName": "Acme Lint",
                "shortDescription": "Lints python too",
                "statistics": [{"statisticName": "install", "value": 50.0}],
            }),
        );
        write_extension_with(
            &ext,
            "zeta.alpha",
            &[("0.1.0", "2024-01-01T00:00:00Z")],
            serde_json::json!({
                "displayName": "Alpha",
                "statistics": [{"statisticName": "install", "value": 50.0}],
                "recommended": true,
            }),
        );
        write_extension(&ext, "evil.ext", &[("6.6.6", "2024-01-01T00:00:00Z")]);
        std::fs::write(layout.malicious(), r#"{"malicious": ["evil.ext"]}"#).unwrap();
        write_extension(layout.custom_extensions(), "corp.tool", &[("1.0.0", "2024-01-01T00:00:00Z")]);
        let snapshot = CacheSnapshot::build(&layout, 1).unwrap();
        (dir, snapshot)
    }

    fn query(criteria: serde_json::Value, extra: serde_json::Value) -> ExtensionQuery {
        let mut filter = serde_json::json!({ "criteria": criteria });
        if let (Some(f), Some(e)) = (filter.as_object_mut(), extra.as_object()) {
            for (k, v) in e {
                f.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(serde_json::json!({ "filters": [filter], "flags": 0 })).unwrap()
    }

    fn ids(result: &QueryResult) -> Vec<String> {
        result
            .extensions
            .iter()
            .map(|e| e.identifier().unwrap().to_string())
            .collect()
    }

    fn run(q: &ExtensionQuery, policy: MaliciousPolicy) -> QueryResult {
        let (_dir, snap) = fixture();
        execute(&snap, q, &options(policy)).unwrap().results.remove(0)
    }

    #[test]
    fn search_text_matches_fields_and_sorts_by_installs() {
        let q = query(
            serde_json::json!([{"filterType": 8, "value": MARKETPLACE_TARGET}, {"filterType": 10, "value": "PYTHON"}]),
            serde_json::json!({}),
        );
        let r = run(&q, MaliciousPolicy::Exclude);
        assert_eq!(ids(&r), vec!["ms-python.python", "acme.lint"]);
        assert_eq!(r.total_count(), Some(2));
    }

    #[test]
    fn ties_break_by_identifier() {
        let q = query(
            serde_json::json!([{"filterType": 10, "value": "a"}]),
            serde_json::json!({"sortBy": 4}),
        );
        let r = run(&q, MaliciousPolicy::Exclude);
        let got = ids(&r);
        let lint = got.iter().position(|i| i == "acme.lint").unwrap();
        let alpha = got.iter().position(|i| i == "zeta.alpha").unwrap();
        assert!(lint < alpha);
    }

    #[test]
    fn title_sort_defaults_to_ascending() {
        let q = query(
            serde_json::json!([{"filterType": 10, "value": "a"}]),
            serde_json::json!({"sortBy": 2}),
        );
        let r = run(&q, MaliciousPolicy::Exclude);
        let got = ids(&r);
        assert_eq!(got.first().map(String::as_str), Some("acme.lint"));
    }

    #[test]
    fn empty_search_returns_recommended() {
        let q = query(
            serde_json::json!([{"filterType": 8, "value": MARKETPLACE_TARGET}, {"filterType": 12, "value": "4096"}]),
            serde_json::json!({}),
        );
        let r = run(&q, MaliciousPolicy::Exclude);
        assert_eq!(ids(&r), vec!["ms-python.python", "zeta.alpha"]);
    }

    #[test]
    fn lookup_by_name_and_guid() {
        let q = query(
            serde_json::json!([{"filterType": 7, "value": "ACME.Lint"}, {"filterType": 4, "value": "CORP.TOOL-GUID"}]),
            serde_json::json!({}),
        );
        let r = run(&q, MaliciousPolicy::Exclude);
        assert_eq!(ids(&r), vec!["acme.lint", "corp.tool"]);
    }

    #[test]
    fn malformed_names_are_client_errors() {
        let (_dir, snap) = fixture();
        for bad in ["nodot", ".name", "publisher.", "a.b.c"] {
            let q = query(serde_json::json!([{"filterType": 7, "value": bad}]), serde_json::json!({}));
            let err = execute(&snap, &q, &options(MaliciousPolicy::Exclude)).unwrap_err();
            assert_eq!(err.status(), 400, "{bad}");
            assert_eq!(err.code(), "invalid_identifier");
        }
    }

    #[test]
    fn structural_validation() {
        let (_dir, snap) = fixture();
        let opts = options(MaliciousPolicy::Exclude);
        let empty: ExtensionQuery = serde_json::from_str(r#"{"filters": []}"#).unwrap();
        assert!(matches!(execute(&snap, &empty, &opts), Err(GalleryError::InvalidQuery(_))));
        let no_criteria = query(serde_json::json!([]), serde_json::json!({}));
        assert!(matches!(execute(&snap, &no_criteria, &opts), Err(GalleryError::InvalidQuery(_))));
        let page_zero = query(
            serde_json::json!([{"filterType": 10, "value": "x"}]),
            serde_json::json!({"pageNumber": 0}),
        );
        assert!(matches!(execute(&snap, &page_zero, &opts), Err(GalleryError::InvalidQuery(_))));
    }

    #[test]
    fn malicious_policy_excludes_or_flags() {
        let q = query(serde_json::json!([{"filterType": 7, "value": "evil.ext"}]), serde_json::json!({}));
        let excluded = run(&q, MaliciousPolicy::Exclude);
        assert!(excluded.extensions.is_empty());
        assert_eq!(excluded.total_count(), Some(0));

        let flagged = run(&q, MaliciousPolicy::Flag);
        assert_eq!(ids(&flagged), vec!["evil.ext"]);
        assert!(flagged.extensions[0].flags.contains(MALICIOUS_FLAG));
    }

    #[test]
    fn latest_only_is_chronological_and_assets_are_rewritten() {
        let mut q = query(serde_json::json!([{"filterType": 7, "value": "acme.lint"}]), serde_json::json!({}));
        q.flags = QueryFlags::INCLUDE_LATEST_VERSION_ONLY;
        let r = run(&q, MaliciousPolicy::Exclude);
        let versions = &r.extensions[0].versions;
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, "1.9.0");
        assert_eq!(
            versions[0].asset_uri,
            format!("{ROOT}/artifacts/extensions/acme.lint/1.9.0")
        );
        assert_eq!(
            versions[0].files[0].source,
            format!("{ROOT}/artifacts/extensions/acme.lint/1.9.0/Microsoft.VisualStudio.Services.VSIXPackage")
        );

        let custom = query(serde_json::json!([{"filterType": 7, "value": "corp.tool"}]), serde_json::json!({}));
        let r = run(&custom, MaliciousPolicy::Exclude);
        assert_eq!(
            r.extensions[0].versions[0].asset_uri,
            format!("{ROOT}/custom-extensions/corp.tool/1.0.0")
        );
    }

    #[test]
    fn pagination_reports_full_total() {
        let q = query(
            serde_json::json!([{"filterType": 10, "value": "a"}]),
            serde_json::json!({"pageSize": 1, "pageNumber": 2, "sortBy": 2}),
        );
        let all = query(
            serde_json::json!([{"filterType": 10, "value": "a"}]),
            serde_json::json!({"sortBy": 2}),
        );
        let page = run(&q, MaliciousPolicy::Exclude);
        let full = run(&all, MaliciousPolicy::Exclude);
        assert_eq!(page.extensions.len(), 1);
        assert_eq!(page.total_count(), full.total_count());
        assert_eq!(ids(&page)[0], ids(&full)[1]);
    }

    #[test]
    fn tag_criteria_narrow() {
        let q = query(serde_json::json!([{"filterType": 1, "value": "Python"}]), serde_json::json!({}));
        let r = run(&q, MaliciousPolicy::Exclude);
        assert_eq!(ids(&r), vec!["ms-python.python"]);
    }

    #[test]
    fn recommended_ids_respect_policy() {
        let (_dir, snap) = fixture();
        let ids = recommended_ids(&snap, MaliciousPolicy::Exclude);
        assert_eq!(ids.len(), 2);
    }
}
