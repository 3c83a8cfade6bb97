//! Update checks and commit downloads.

use crate::gallery::{Gallery, GalleryError};
use crate::paths::is_safe_segment;
use crate::store::{StoreError, read_json};
use std::path::{Path, PathBuf};
use std::sync::PoisonError;
use vscmirror_schema::{BinaryRecord, Channel, Platform, Sha256Digest, UpdateInfo};

/// Result of an update check.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAnswer {
    /// The client already runs the newest stored build (HTTP 204).
    UpToDate,
    /// A newer build, with `url` pointing at this mirror.
    Available(UpdateInfo),
}

impl Gallery {
    /// Answer `GET /api/update/<platform>/<channel>/<commit>`.
    ///
    /// The client is up to date when it runs the stored build, or a stored
    /// build that is not older than it.
    ///
    /// # Errors
    ///
    /// Unknown platform or channel, [`GalleryError::NotFound`] when nothing
    /// is stored, [`GalleryError::Integrity`] when the payload no longer
    /// matches its digest.
    pub async fn update(
        &self,
        platform: &str,
        channel: &str,
        commit: &str,
    ) -> Result<UpdateAnswer, GalleryError> {
        let (platform, channel) = resolve(platform, channel)?;
        let layout = self.layout();
        let Some(latest) = read_json::<BinaryRecord>(&layout.binary_latest(platform, channel))? else {
            return Err(GalleryError::NotFound(format!("build for {platform}/{channel}")));
        };

        if latest.commit() == commit {
            return Ok(UpdateAnswer::UpToDate);
        }
        if is_safe_segment(commit) {
            let known = read_json::<BinaryRecord>(&layout.binary_commit(platform, channel, commit))
                .ok()
                .flatten();
            if known.is_some_and(|k| k.update.timestamp >= latest.update.timestamp) {
                return Ok(UpdateAnswer::UpToDate);
            }
        }

        let url = self.verified_url(&latest).await?;
        tracing::debug!(%platform, %channel, from = commit, to = latest.commit(), "Offering update");
        let mut info = latest.update;
        info.url = url;
        Ok(UpdateAnswer::Available(info))
    }

    /// Resolve `GET /commit:<commit>/<platform>/<channel>` to the payload URL.
    ///
    /// # Errors
    ///
    /// As [`Gallery::update`]; an unknown commit is [`GalleryError::NotFound`].
    pub async fn commit_location(
        &self,
        commit: &str,
        platform: &str,
        channel: &str,
    ) -> Result<String, GalleryError> {
        let (platform, channel) = resolve(platform, channel)?;
        let not_found = || GalleryError::NotFound(format!("commit {commit}"));
        if !is_safe_segment(commit) {
            return Err(not_found());
        }
        let record = read_json::<BinaryRecord>(&self.layout().binary_commit(platform, channel, commit))?
            .ok_or_else(not_found)?;
        self.verified_url(&record).await
    }

    async fn verified_url(&self, record: &BinaryRecord) -> Result<String, GalleryError> {
        let path = self
            .layout()
            .installer_dir(record.platform, record.channel)
            .join(&record.file);
        if !path.is_file() {
            return Err(GalleryError::NotFound(record.file.clone()));
        }
        if let Some(expected) = &record.update.sha256 {
            self.verify(&path, expected).await?;
        }
        Ok(format!(
            "{}/artifacts/installers/{}/{}/{}",
            self.url_root(),
            record.platform.id,
            record.channel,
            record.file
        ))
    }

    /// Hash `path` unless it was verified before and has not changed since.
    async fn verify(&self, path: &Path, expected: &Sha256Digest) -> Result<(), GalleryError> {
        let meta = std::fs::metadata(path).map_err(|e| StoreError::io(path, e))?;
        let stamp = (meta.modified().map_err(|e| StoreError::io(path, e))?, meta.len());
        let seen = self
            .verified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .is_some_and(|s| *s == stamp);
        if seen {
            return Ok(());
        }

        let owned: PathBuf = path.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || Sha256Digest::of_file(&owned))
            .await
            .map_err(|e| StoreError::io(path, std::io::Error::other(e)))?
            .map_err(|e| StoreError::io(path, e))?;
        if actual != *expected {
            tracing::warn!(path = %path.display(), %expected, %actual, "Payload digest mismatch");
            return Err(GalleryError::Integrity(
                path.file_name()
                    .map_or_else(String::new, |n| n.to_string_lossy().into_owned()),
            ));
        }
        self.verified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), stamp);
        Ok(())
    }
}

fn resolve(platform: &str, channel: &str) -> Result<(&'static Platform, Channel), GalleryError> {
    Ok((Platform::lookup(platform)?, channel.parse::<Channel>()?))
}
