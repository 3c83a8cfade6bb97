//! Streaming download with SHA256 verification.
//!
//! Bytes go to a temporary file beside the destination while being hashed;
//! the file is renamed into place only after the digest checks out, so a
//! reader never sees a partial payload. Each retry starts from scratch.

use crate::io::fetch::{FetchClient, FetchError, status_error};
use futures::StreamExt;
use reqwest::header::USER_AGENT;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use vscmirror_schema::Sha256Digest;

/// Result of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    /// Digest of the bytes written.
    pub sha256: Sha256Digest,
    /// Number of bytes written.
    pub size: u64,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
    move |source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn temp_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nonce: u32 = rand::random();
    dest.with_file_name(format!(".{name}.{nonce:08x}.part"))
}

impl FetchClient {
    /// Download `url` to `dest`, optionally verifying its SHA256.
    ///
    /// # Errors
    ///
    /// Transport failures are retried like [`FetchClient::fetch`]. A digest
    /// mismatch is returned as [`FetchError::ChecksumMismatch`] without retry,
    /// and no file is left behind.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        expected: Option<&Sha256Digest>,
    ) -> Result<Downloaded, FetchError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        self.with_retry(url, || self.download_once(url, dest, expected))
            .await
    }

    async fn download_once(
        &self,
        url: &str,
        dest: &Path,
        expected: Option<&Sha256Digest>,
    ) -> Result<Downloaded, FetchError> {
        let tmp = temp_path_for(dest);
        let result = self.stream_to(url, &tmp).await;
        let downloaded = match result {
            Ok(d) => d,
            Err(e) => {
                tokio::fs::remove_file(&tmp).await.ok();
                return Err(e);
            }
        };

        if let Some(expected) = expected {
            if expected != &downloaded.sha256 {
                tokio::fs::remove_file(&tmp).await.ok();
                return Err(FetchError::ChecksumMismatch {
                    url: url.to_string(),
                    expected: expected.to_string(),
                    actual: downloaded.sha256.to_string(),
                });
            }
        }

        if let Err(e) = tokio::fs::rename(&tmp, dest).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(io_err(dest)(e));
        }
        Ok(downloaded)
    }

    async fn stream_to(&self, url: &str, tmp: &Path) -> Result<Downloaded, FetchError> {
        let response = self
            .http()
            .get(url)
            .header(USER_AGENT, self.user_agent())
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(status_error(url, response.status(), response.headers()));
        }

        let mut file = File::create(tmp).await.map_err(io_err(tmp))?;
        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;

        while let Some(chunk) = stream.next().await {
            if self.cancel_token().is_cancelled() {
                return Err(FetchError::Cancelled(url.to_string()));
            }
            let chunk = chunk.map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk).await.map_err(io_err(tmp))?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
        }

        file.flush().await.map_err(io_err(tmp))?;
        file.sync_all().await.map_err(io_err(tmp))?;

        Ok(Downloaded {
            sha256: Sha256Digest::from_hasher(hasher),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::retry::RetryPolicy;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn client() -> FetchClient {
        FetchClient::new("1.95.0", RetryPolicy::no_retry(), CancellationToken::new()).unwrap()
    }

    #[tokio::test]
    async fn download_verifies_and_renames() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/payload")
            .with_status(200)
            .with_body("hello world")
            .create_async()
            .await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested").join("vscode-1.0.0.tar.gz");
        let expected = Sha256Digest::new(HELLO).unwrap();

        let got = client()
            .download(&format!("{}/payload", server.url()), &dest, Some(&expected))
            .await
            .unwrap();
        assert_eq!(got.sha256, expected);
        assert_eq!(got.size, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert_eq!(std::fs::read_dir(dest.parent().unwrap()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn checksum_mismatch_leaves_nothing_behind() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/payload")
            .with_status(200)
            .with_body("tampered")
            .create_async()
            .await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("vscode-1.0.0.zip");
        let expected = Sha256Digest::new(HELLO).unwrap();

        let err = client()
            .download(&format!("{}/payload", server.url()), &dest, Some(&expected))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ChecksumMismatch { .. }));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
