//! Version ordering.
//!
//! Marketplace versions are ordered by publication time, newest first. Version
//! strings are only a tie-breaker: publishers do ship `1.9.x` maintenance
//! builds after `1.10.0`, and clients expect the most recently published
//! build to be "latest".

use crate::gallery::GalleryVersion;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Parse a version string, padding short numeric forms (`1.2` -> `1.2.0`).
pub fn parse_lenient(s: &str) -> Option<semver::Version> {
    let s = s.trim().trim_start_matches('v');
    if let Ok(v) = semver::Version::parse(s) {
        return Some(v);
    }
    let (core, rest) = match s.find(['-', '+']) {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    semver::Version::parse(&format!("{}{rest}", parts.join("."))).ok()
}

fn compare_version_strings(a: &str, b: &str) -> Ordering {
    match (parse_lenient(a), parse_lenient(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// Ordering that puts the newest build first.
///
/// Publication timestamp descending (undated builds last), then semantic
/// version descending, then target platform ascending.
pub fn newest_first(a: &GalleryVersion, b: &GalleryVersion) -> Ordering {
    b.last_updated
        .cmp(&a.last_updated)
        .then_with(|| compare_version_strings(&b.version, &a.version))
        .then_with(|| a.target_platform.cmp(&b.target_platform))
}

/// Sort in place, newest first.
pub fn sort_newest_first(versions: &mut [GalleryVersion]) {
    versions.sort_by(newest_first);
}

/// The newest build, optionally skipping prereleases.
pub fn latest(versions: &[GalleryVersion], include_prerelease: bool) -> Option<&GalleryVersion> {
    versions
        .iter()
        .filter(|v| include_prerelease || !v.is_prerelease())
        .min_by(|a, b| newest_first(a, b))
}

/// Key used to group builds by target platform; universal builds share one.
pub fn target_key(v: &GalleryVersion) -> &str {
    if v.is_universal() {
        ""
    } else {
        v.target_platform.as_deref().unwrap_or_default()
    }
}

/// Keep at most `per_target` builds for every target platform, newest first.
///
/// The result is sorted with [`newest_first`].
pub fn retain_newest_per_target(versions: &mut Vec<GalleryVersion>, per_target: usize) {
    sort_newest_first(versions);
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    versions.retain(|v| {
        let n = seen.entry(target_key(v).to_string()).or_default();
        *n += 1;
        *n <= per_target
    });
}

/// Newest build for each target platform, in [`newest_first`] order.
pub fn latest_per_target(versions: &[GalleryVersion]) -> Vec<&GalleryVersion> {
    let mut sorted: Vec<&GalleryVersion> = versions.iter().collect();
    sorted.sort_by(|a, b| newest_first(a, b));
    let mut seen = std::collections::BTreeSet::new();
    sorted.retain(|v| seen.insert(target_key(v).to_string()));
    sorted
}
