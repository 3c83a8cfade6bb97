//! Installer mirroring for one platform and channel.
//!
//! The update service is asked about the build we already hold; a 204 means
//! nothing newer exists. A new build is downloaded, verified against its
//! advertised SHA256, and recorded as `<commit>.json` and `latest.json`.
//! Without `keep_history` the superseded record and payload are removed.

use crate::io::fetch::{FetchError, FetchRequest};
use crate::paths::is_safe_segment;
use crate::reporter::Reporter;
use crate::store::{ArtifactStore, LedgerEntry, StoreError, read_json};
use crate::sync::{ItemContext, SyncError};
use std::path::Path;
use vscmirror_schema::{BinaryRecord, Channel, Platform, UpdateInfo};

/// `<base>/<platform>/<channel>/<commit>`
pub fn update_url(base: &str, platform: &Platform, channel: Channel, commit: &str) -> String {
    format!(
        "{}/{}/{}/{commit}",
        base.trim_end_matches('/'),
        platform.id,
        channel.as_str()
    )
}

fn load_record(path: &Path) -> Result<Option<BinaryRecord>, StoreError> {
    match read_json::<BinaryRecord>(path) {
        Ok(record) => Ok(record),
        Err(StoreError::Json { path, source }) => {
            tracing::warn!(path = %path.display(), error = %source, "Ignoring corrupt build record");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn write_records(store: &ArtifactStore, record: &BinaryRecord) -> Result<bool, StoreError> {
    let layout = store.layout();
    let commit = store.write_json_if_changed(
        &layout.binary_commit(record.platform, record.channel, record.commit()),
        record,
    )?;
    let latest =
        store.write_json_if_changed(&layout.binary_latest(record.platform, record.channel), record)?;
    Ok(commit || latest)
}

pub(crate) async fn sync_binary<R: Reporter>(
    ctx: &ItemContext<'_, R>,
    platform: &'static Platform,
    channel: Channel,
) -> Result<bool, SyncError> {
    let layout = ctx.store.layout();
    let dir = layout.installer_dir(platform, channel);
    let stored = load_record(&layout.binary_latest(platform, channel))?;
    let current = stored
        .as_ref()
        .filter(|r| !ctx.config.force && dir.join(&r.file).is_file());

    let asked = current.map_or("latest", BinaryRecord::commit);
    let url = update_url(&ctx.config.upstream.update, platform, channel, asked);
    let resp = ctx.fetch.fetch(&FetchRequest::get(url.as_str())).await?;

    if resp.is_no_content() {
        return match current {
            Some(record) => Ok(write_records(ctx.store, record)?),
            None => Err(SyncError::Protocol(format!(
                "{url} answered 204 but no build is stored"
            ))),
        };
    }

    let update: UpdateInfo =
        serde_json::from_slice(&resp.body).map_err(|e| FetchError::protocol(&url, e))?;
    if !is_safe_segment(&update.version) || !is_safe_segment(&update.payload_file_name()) {
        return Err(SyncError::Protocol(format!(
            "refusing build {:?} ({:?})",
            update.version, update.name
        )));
    }
    if let Some(record) = current.filter(|r| r.commit() == update.version) {
        return Ok(write_records(ctx.store, record)?);
    }

    let record = BinaryRecord::new(update, platform, channel);
    fetch_payload(ctx, &record, &dir.join(&record.file)).await?;
    write_records(ctx.store, &record)?;

    if let Some(old) = stored.filter(|old| old.commit() != record.commit() && !ctx.config.keep_history) {
        ctx.store
            .remove_file(&layout.binary_commit(platform, channel, old.commit()))?;
        if old.file != record.file {
            ctx.store.remove_file(&dir.join(&old.file))?;
        }
        tracing::debug!(platform = platform.id, %channel, old = old.commit(), "Removed superseded build");
    }

    tracing::info!(
        platform = platform.id,
        %channel,
        commit = record.commit(),
        version = record.update.display_version(),
        "Mirrored installer"
    );
    Ok(true)
}

/// Download the payload, or materialise it from a stored file with the same
/// digest.
async fn fetch_payload<R: Reporter>(
    ctx: &ItemContext<'_, R>,
    record: &BinaryRecord,
    dest: &Path,
) -> Result<(), SyncError> {
    let root = ctx.store.layout().root();
    let url = record.update.url.as_str();
    let expected = record.update.sha256.as_ref();

    let existing = expected.and_then(|digest| {
        ctx.with_ledger(|ledger| ledger.find_by_digest(digest).cloned())
    });
    if let Some(entry) = existing.filter(|e| root.join(&e.path).is_file()) {
        let src = root.join(&entry.path);
        if src != dest {
            ctx.store.link_or_copy(&src, dest)?;
        }
        tracing::debug!(url, from = %entry.path.display(), "Reused identical payload");
        return Ok(());
    }

    let downloaded = ctx.fetch.download(url, dest, expected).await?;
    ctx.store.record_write();
    ctx.reporter.downloaded(url, downloaded.size);
    let path = dest.strip_prefix(root).unwrap_or(dest).to_path_buf();
    ctx.with_ledger(|ledger| {
        ledger.insert(
            url.to_string(),
            LedgerEntry {
                sha256: downloaded.sha256,
                path,
                size: downloaded.size,
            },
        )
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::Harness;
    use vscmirror_schema::Sha256Digest;

    fn linux() -> &'static Platform {
        Platform::lookup("linux-x64").unwrap()
    }

    fn update_body(base: &str, commit: &str, name: &str, payload: &[u8]) -> String {
        serde_json::json!({
            "url": format!("{base}/dl/{commit}.tar.gz"),
            "name": name,
            "version": commit,
            "productVersion": name,
            "timestamp": 1_700_000_000_000_i64,
            "sha256hash": Sha256Digest::of(payload).as_str(),
        })
        .to_string()
    }

    #[test]
    fn update_urls() {
        assert_eq!(
            update_url("https://u/api/update/", linux(), Channel::Insider, "latest"),
            "https://u/api/update/linux-x64/insider/latest"
        );
    }

    async fn seed_old_build(server: &mut mockito::ServerGuard, h: &Harness) {
        let base = server.url();
        let _latest = server
            .mock("GET", "/api/update/linux-x64/stable/latest")
            .with_status(200)
            .with_body(update_body(&base, "old", "1.0.0", b"old payload"))
            .create_async()
            .await;
        let _m1 = server
            .mock("GET", "/dl/old.tar.gz")
            .with_status(200)
            .with_body("old payload")
            .create_async()
            .await;
        assert!(sync_binary(&h.ctx(), linux(), Channel::Stable).await.unwrap());
    }

    #[tokio::test]
    async fn new_build_supersedes_old() {
        let mut server = mockito::Server::new_async().await;
        let h = Harness::new(&server.url(), |_| {});
        seed_old_build(&mut server, &h).await;

        let base = server.url();
        let _m2 = server
            .mock("GET", "/api/update/linux-x64/stable/old")
            .with_status(200)
            .with_body(update_body(&base, "new", "1.1.0", b"new payload"))
            .create_async()
            .await;
        let _m3 = server
            .mock("GET", "/dl/new.tar.gz")
            .with_status(200)
            .with_body("new payload")
            .create_async()
            .await;
        assert!(sync_binary(&h.ctx(), linux(), Channel::Stable).await.unwrap());

        let dir = h.store.layout().installer_dir(linux(), Channel::Stable);
        assert!(dir.join("new.json").is_file());
        assert!(dir.join("vscode-1.1.0-new.tar.gz").is_file());
        assert!(!dir.join("old.json").exists());
        assert!(!dir.join("vscode-1.0.0-old.tar.gz").exists());
        let latest: BinaryRecord = read_json(&dir.join("latest.json")).unwrap().unwrap();
        assert_eq!(latest.commit(), "new");
    }

    #[tokio::test]
    async fn keep_history_retains_old_build() {
        let mut server = mockito::Server::new_async().await;
        let h = Harness::new(&server.url(), |c| c.keep_history = true);
        seed_old_build(&mut server, &h).await;

        let base = server.url();
        let _m4 = server
            .mock("GET", "/api/update/linux-x64/stable/old")
            .with_status(200)
            .with_body(update_body(&base, "new", "1.1.0", b"new payload"))
            .create_async()
            .await;
        let _m5 = server
            .mock("GET", "/dl/new.tar.gz")
            .with_status(200)
            .with_body("new payload")
            .create_async()
            .await;
        sync_binary(&h.ctx(), linux(), Channel::Stable).await.unwrap();

        let dir = h.store.layout().installer_dir(linux(), Channel::Stable);
        assert!(dir.join("old.json").is_file());
        assert!(dir.join("vscode-1.0.0-old.tar.gz").is_file());
        assert!(dir.join("new.json").is_file());
    }

    #[tokio::test]
    async fn respin_under_same_name_keeps_retained_payload() {
        let mut server = mockito::Server::new_async().await;
        let h = Harness::new(&server.url(), |c| c.keep_history = true);
        seed_old_build(&mut server, &h).await;

        let base = server.url();
        let _m = server
            .mock("GET", "/api/update/linux-x64/stable/old")
            .with_status(200)
            .with_body(update_body(&base, "respin", "1.0.0", b"respin payload"))
            .create_async()
            .await;
        let _d = server
            .mock("GET", "/dl/respin.tar.gz")
            .with_status(200)
            .with_body("respin payload")
            .create_async()
            .await;
        assert!(sync_binary(&h.ctx(), linux(), Channel::Stable).await.unwrap());

        let dir = h.store.layout().installer_dir(linux(), Channel::Stable);
        let old: BinaryRecord = read_json(&dir.join("old.json")).unwrap().unwrap();
        let new: BinaryRecord = read_json(&dir.join("respin.json")).unwrap().unwrap();
        assert_ne!(old.file, new.file);
        let digest = Sha256Digest::of_file(&dir.join(&old.file)).unwrap();
        assert_eq!(old.update.sha256, Some(digest));
        assert_eq!(std::fs::read(dir.join(&new.file)).unwrap(), b"respin payload");
    }

    #[tokio::test]
    async fn checksum_mismatch_stores_nothing() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _m6 = server
            .mock("GET", "/api/update/linux-x64/stable/latest")
            .with_status(200)
            .with_body(update_body(&base, "abc", "1.0.0", b"expected"))
            .create_async()
            .await;
        let _m7 = server
            .mock("GET", "/dl/abc.tar.gz")
            .with_status(200)
            .with_body("tampered")
            .create_async()
            .await;
        let h = Harness::new(&base, |_| {});
        let err = sync_binary(&h.ctx(), linux(), Channel::Stable)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Fetch(FetchError::ChecksumMismatch { .. })));
        assert!(!err.is_fatal());
        let dir = h.store.layout().installer_dir(linux(), Channel::Stable);
        assert!(!dir.join("latest.json").exists());
        assert!(!dir.join("vscode-1.0.0-abc.tar.gz").exists());
    }

    #[tokio::test]
    async fn unsafe_build_names_are_refused() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _m8 = server
            .mock("GET", "/api/update/linux-x64/stable/latest")
            .with_status(200)
            .with_body(update_body(&base, "../escape", "1.0.0", b"x"))
            .create_async()
            .await;
        let h = Harness::new(&base, |_| {});
        let err = sync_binary(&h.ctx(), linux(), Channel::Stable)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
