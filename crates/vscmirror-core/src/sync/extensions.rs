//! Extension mirroring.
//!
//! For each extension: fetch every version, keep the builds this mirror
//! serves, make sure each kept build's assets are on disk, then write the
//! per-build `extension.json` and the extension's `latest.json`. Files are
//! only rewritten when their bytes change, and `updated.json` is touched only
//! when something did.

use crate::paths::{EXTENSION_FILE, is_safe_segment};
use crate::reporter::Reporter;
use crate::store::{LedgerEntry, StoreError};
use crate::sync::{ItemContext, SyncError};
use chrono::Utc;
use std::path::Path;
use vscmirror_schema::version::retain_newest_per_target;
use vscmirror_schema::{ExtensionId, GalleryVersion, MaliciousList, Platform, Sha256Digest};

/// Builds of one extension that the mirror keeps.
///
/// Prereleases go unless `prerelease`; platform-specific builds go unless a
/// resolved platform hosts their target; names that cannot be stored safely
/// go. Of the rest, the newest `per_target` per target platform remain.
pub fn select_versions(
    versions: Vec<GalleryVersion>,
    platforms: &[&'static Platform],
    prerelease: bool,
    per_target: usize,
) -> Vec<GalleryVersion> {
    let mut kept: Vec<GalleryVersion> = versions
        .into_iter()
        .filter(|v| prerelease || !v.is_prerelease())
        .filter(|v| {
            v.is_universal()
                || v.target_platform
                    .as_deref()
                    .is_some_and(|t| platforms.iter().any(|p| p.hosts_extension_target(t)))
        })
        .filter(|v| {
            let safe = is_safe_segment(&v.version)
                && (v.is_universal() || v.target_platform.as_deref().is_some_and(is_safe_segment));
            if !safe {
                tracing::warn!(version = %v.version, target = ?v.target_platform, "Skipping unsafe build name");
            }
            safe
        })
        .collect();
    retain_newest_per_target(&mut kept, per_target);
    kept
}

pub(crate) async fn sync_extension<R: Reporter>(
    ctx: &ItemContext<'_, R>,
    id: &ExtensionId,
    recommended: bool,
) -> Result<bool, SyncError> {
    let Some(mut ext) = ctx.marketplace().extension(id).await? else {
        return Err(SyncError::NotFound(id.to_string()));
    };

    let all = std::mem::take(&mut ext.versions);
    let total = all.len();
    ext.versions = select_versions(
        all,
        ctx.platforms,
        ctx.config.prerelease,
        ctx.config.versions_per_extension,
    );
    if ext.versions.is_empty() {
        tracing::debug!(%id, total, "No builds selected");
        return Ok(false);
    }

    let mut changed = false;
    for version in &ext.versions {
        changed |= sync_version(ctx, id, version).await?;
    }
    ext.recommended = recommended;

    let layout = ctx.store.layout();
    changed |= ctx
        .store
        .write_json_if_changed(&layout.extension_latest(id), &ext)?;
    if changed {
        ctx.store.write_json_if_changed(
            &layout.extension_marker(id),
            &serde_json::json!({ "updated": Utc::now() }),
        )?;
        tracing::info!(%id, builds = ext.versions.len(), "Mirrored extension");
    }
    Ok(changed)
}

async fn sync_version<R: Reporter>(
    ctx: &ItemContext<'_, R>,
    id: &ExtensionId,
    version: &GalleryVersion,
) -> Result<bool, SyncError> {
    let dir = ctx.store.layout().version_dir(id, &version.relative_dir());
    let mut changed = false;
    for file in &version.files {
        if !is_safe_segment(&file.asset_type) {
            tracing::warn!(%id, asset = %file.asset_type, "Skipping unsafe asset type");
            continue;
        }
        changed |= ensure_asset(ctx, &file.source, &dir.join(&file.asset_type)).await?;
    }
    changed |= ctx
        .store
        .write_json_if_changed(&dir.join(EXTENSION_FILE), version)?;
    Ok(changed)
}

/// Make sure `dest` holds the asset served at `url`.
///
/// Known URLs are not fetched again; a known URL whose file lives under
/// another label is linked (or copied) instead of downloaded. A fresh
/// download whose bytes the store already holds is replaced by a link to
/// the stored file.
async fn ensure_asset<R: Reporter>(
    ctx: &ItemContext<'_, R>,
    url: &str,
    dest: &Path,
) -> Result<bool, SyncError> {
    let root = ctx.store.layout().root();
    let relative = dest.strip_prefix(root).unwrap_or(dest).to_path_buf();
    let known = ctx.with_ledger(|ledger| ledger.get(url).cloned());

    if let Some(entry) = known {
        if dest.is_file() {
            return Ok(false);
        }
        let src = root.join(&entry.path);
        if src.is_file() {
            ctx.store.link_or_copy(&src, dest)?;
            return Ok(true);
        }
    } else if dest.is_file() {
        let sha256 = hash_file(dest).await?;
        let size = std::fs::metadata(dest)
            .map_err(|e| StoreError::io(dest, e))?
            .len();
        ctx.with_ledger(|ledger| {
            ledger.insert(
                url.to_string(),
                LedgerEntry {
                    sha256,
                    path: relative,
                    size,
                },
            )
        });
        return Ok(false);
    }

    let downloaded = ctx.fetch.download(url, dest, None).await?;
    ctx.store.record_write();
    ctx.reporter.downloaded(url, downloaded.size);

    let twin = ctx.with_ledger(|ledger| {
        ledger
            .find_by_digest(&downloaded.sha256)
            .filter(|e| e.path != relative && root.join(&e.path).is_file())
            .map(|e| e.path.clone())
    });
    if let Some(twin) = twin {
        ctx.store.remove_file(dest)?;
        ctx.store.link_or_copy(&root.join(&twin), dest)?;
        tracing::debug!(url, from = %twin.display(), "Linked duplicate asset");
    }

    ctx.with_ledger(|ledger| {
        ledger.insert(
            url.to_string(),
            LedgerEntry {
                sha256: downloaded.sha256,
                path: relative,
                size: downloaded.size,
            },
        )
    });
    Ok(true)
}

async fn hash_file(path: &Path) -> Result<Sha256Digest, StoreError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || Sha256Digest::of_file(&owned))
        .await
        .map_err(|e| StoreError::io(path, std::io::Error::other(e)))?
        .map_err(|e| StoreError::io(path, e))
}

pub(crate) async fn sync_malicious_list<R: Reporter>(
    ctx: &ItemContext<'_, R>,
) -> Result<bool, SyncError> {
    let bytes = ctx.marketplace().malicious_control().await?;
    let list = MaliciousList::from_control_file(&bytes)
        .map_err(|e| SyncError::Protocol(format!("malicious list: {e}")))?;
    let wrote = ctx
        .store
        .write_if_changed(&ctx.store.layout().malicious(), &bytes)?;
    if wrote {
        tracing::info!(entries = list.len(), "Malicious list updated");
    }
    Ok(wrote)
}
