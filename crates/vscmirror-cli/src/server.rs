//! Axum router exposing the gallery at the upstream URL shapes
//!
//! ```text
//! /
//! ├── /api/update/{platform}/{channel}/{commit}   - update check
//! ├── /commit:{commit}/{platform}/{channel}       - installer by commit (fallback)
//! ├── /_apis/public/gallery/extensionquery        - marketplace query
//! ├── /extensions/marketplace.json                - malicious list
//! ├── /extensions/workspaceRecommendations.json.gz
//! ├── /artifacts/{*path}                          - store downloads
//! ├── /custom-extensions/{*path}                  - private extension downloads
//! ├── /status.json
//! └── /healthz
//! ```

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio_util::io::ReaderStream;
use vscmirror_core::gallery::update::UpdateAnswer;
use vscmirror_core::gallery::{Gallery, GalleryError, Passthrough};
use vscmirror_core::store::StoreError;
use vscmirror_schema::ExtensionQuery;

const COMMIT_PREFIXES: [&str; 3] = ["/commit:", "/commit%3A", "/commit%3a"];

/// Build the router over `gallery`.
pub fn router(gallery: Arc<Gallery>) -> Router {
    Router::new()
        .route("/api/update/{platform}/{channel}/{commit}", get(update))
        .route("/_apis/public/gallery/extensionquery", post(extension_query))
        .route("/extensions/marketplace.json", get(malicious))
        .route("/extensions/workspaceRecommendations.json.gz", get(recommendations))
        .route("/artifacts/{*path}", get(artifact))
        .route("/custom-extensions/{*path}", get(custom_artifact))
        .route("/status.json", get(status))
        .route("/healthz", get(healthz))
        // `commit:` shares its segment with the parameter, which the path
        // matcher cannot express.
        .fallback(commit_download)
        .with_state(gallery)
}

/// A gallery error rendered as `{code, message}` with its HTTP status.
#[derive(Debug)]
pub struct ApiError(GalleryError);

impl From<GalleryError> for ApiError {
    fn from(err: GalleryError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, code = self.0.code(), "Request rejected");
        }
        (status, Json(self.0.body())).into_response()
    }
}

async fn update(
    State(gallery): State<Arc<Gallery>>,
    Path((platform, channel, commit)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    match gallery.update(&platform, &channel, &commit).await? {
        UpdateAnswer::UpToDate => Ok(StatusCode::NO_CONTENT.into_response()),
        UpdateAnswer::Available(info) => Ok(Json(info).into_response()),
    }
}

async fn extension_query(
    State(gallery): State<Arc<Gallery>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let query: ExtensionQuery = serde_json::from_slice(&body)
        .map_err(|e| GalleryError::InvalidQuery(format!("malformed body: {e}")))?;
    let response = gallery.query(&query)?;
    Ok(Json(response).into_response())
}

async fn malicious(State(gallery): State<Arc<Gallery>>) -> Result<Response, ApiError> {
    passthrough(&gallery, Passthrough::Malicious).await
}

async fn recommendations(State(gallery): State<Arc<Gallery>>) -> Result<Response, ApiError> {
    passthrough(&gallery, Passthrough::Recommendations).await
}

async fn passthrough(gallery: &Gallery, which: Passthrough) -> Result<Response, ApiError> {
    let bytes = gallery.passthrough(which).await?;
    // The recommendations file is stored gzipped as upstream serves it.
    let content_type = match which {
        Passthrough::Malicious => "application/json",
        Passthrough::Recommendations => "application/gzip",
    };
    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
        bytes,
    )
        .into_response())
}

async fn artifact(
    State(gallery): State<Arc<Gallery>>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    send_file(&gallery.artifact_path(&path)?).await
}

async fn custom_artifact(
    State(gallery): State<Arc<Gallery>>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    send_file(&gallery.custom_path(&path)?).await
}

async fn status(State(gallery): State<Arc<Gallery>>) -> impl IntoResponse {
    Json(gallery.status())
}

async fn healthz(State(gallery): State<Arc<Gallery>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "generation": gallery.cache().current().generation,
    }))
}

async fn commit_download(
    State(gallery): State<Arc<Gallery>>,
    method: Method,
    uri: Uri,
) -> Result<Response, ApiError> {
    let not_found = || ApiError(GalleryError::NotFound(uri.path().to_string()));
    if method != Method::GET && method != Method::HEAD {
        return Err(not_found());
    }
    let Some((commit, platform, channel)) = parse_commit_path(uri.path()) else {
        return Err(not_found());
    };
    let location = gallery.commit_location(commit, platform, channel).await?;
    tracing::debug!(commit, platform, channel, %location, "Redirecting commit download");
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

/// Split `/commit:<commit>/<platform>/<channel>` into its parts.
fn parse_commit_path(path: &str) -> Option<(&str, &str, &str)> {
    let rest = COMMIT_PREFIXES
        .iter()
        .find_map(|prefix| path.strip_prefix(prefix))?;
    let mut parts = rest.split('/');
    let commit = parts.next().filter(|s| !s.is_empty())?;
    let platform = parts.next().filter(|s| !s.is_empty())?;
    let channel = parts.next().filter(|s| !s.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    Some((commit, platform, channel))
}

async fn send_file(path: &FsPath) -> Result<Response, ApiError> {
    let io_error = |e| ApiError(GalleryError::Store(StoreError::io(path, e)));
    let file = tokio::fs::File::open(path).await.map_err(io_error)?;
    let len = file.metadata().await.map_err(io_error)?.len();
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        _ => "application/octet-stream",
    };
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
            (header::CONTENT_LENGTH, HeaderValue::from(len)),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use vscmirror_core::StoreLayout;
    use vscmirror_core::cache::{CacheOptions, MetadataCache};
    use vscmirror_core::config::GalleryConfig;
    use vscmirror_core::store::atomic_write;
    use vscmirror_schema::{BinaryRecord, Channel, Platform, Sha256Digest, UpdateInfo};

    struct TestServer {
        base: String,
        client: reqwest::Client,
        dir: TempDir,
    }

    fn write_extension(layout: &StoreLayout) {
        let dir = layout.extensions().join("acme.tool");
        let build = serde_json::json!({
            "version": "1.0.0",
            "lastUpdated": "2024-01-01T00:00:00Z",
            "files": [{"assetType": "Microsoft.VisualStudio.Services.VSIXPackage", "source": "https://upstream/vsix"}],
            "assetUri": "https://upstream/assets",
            "fallbackAssetUri": "https://upstream/fallback",
        });
        std::fs::create_dir_all(dir.join("1.0.0")).unwrap();
        std::fs::write(dir.join("1.0.0/extension.json"), build.to_string()).unwrap();
        std::fs::write(
            dir.join("1.0.0/Microsoft.VisualStudio.Services.VSIXPackage"),
            b"vsix-bytes",
        )
        .unwrap();
        let latest = serde_json::json!({
            "publisher": {"publisherId": "acme", "publisherName": "acme", "displayName": "Acme"},
            "extensionId": "acme-tool-guid",
            "extensionName": "tool",
            "displayName": "Tool",
            "shortDescription": "Does tool things",
            "versions": [build],
            "recommended": true,
        });
        std::fs::write(dir.join("latest.json"), latest.to_string()).unwrap();
    }

    fn write_installer(layout: &StoreLayout) {
        let platform = Platform::lookup("linux-x64").unwrap();
        let payload = b"installer";
        let update: UpdateInfo = serde_json::from_value(serde_json::json!({
            "url": "https://upstream/abc.tar.gz",
            "name": "1.0.0",
            "version": "abc",
            "timestamp": 100,
            "sha256hash": Sha256Digest::of(payload).as_str(),
        }))
        .unwrap();
        let record = BinaryRecord::new(update, platform, Channel::Stable);
        let dir = layout.installer_dir(platform, Channel::Stable);
        atomic_write(&dir.join(&record.file), payload).unwrap();
        let json = serde_json::to_vec(&record).unwrap();
        atomic_write(&layout.binary_commit(platform, Channel::Stable, "abc"), &json).unwrap();
        atomic_write(&layout.binary_latest(platform, Channel::Stable), &json).unwrap();
    }

    async fn start() -> TestServer {
        let dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(dir.path());
        write_extension(&layout);
        write_installer(&layout);
        std::fs::write(layout.malicious(), br#"{"malicious":["evil.ext"]}"#).unwrap();

        let options = CacheOptions {
            cache_dir: None,
            refresh_interval: Duration::from_secs(3600),
            debounce: Duration::from_millis(10),
            watch: false,
        };
        let cache = MetadataCache::start(layout.clone(), options, &CancellationToken::new())
            .await
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base = format!("http://{addr}");
        let config = GalleryConfig {
            url_root: base.clone(),
            ..GalleryConfig::default()
        };
        let gallery = Arc::new(Gallery::new(Arc::new(cache), layout, &config));
        let app = router(gallery);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        TestServer {
            base,
            client,
            dir,
        }
    }

    #[test]
    fn commit_paths() {
        assert_eq!(
            parse_commit_path("/commit:abc/linux-x64/stable"),
            Some(("abc", "linux-x64", "stable"))
        );
        assert_eq!(
            parse_commit_path("/commit%3Aabc/linux-x64/stable"),
            Some(("abc", "linux-x64", "stable"))
        );
        assert_eq!(parse_commit_path("/commit:abc/linux-x64"), None);
        assert_eq!(parse_commit_path("/commit:abc/linux-x64/stable/extra"), None);
        assert_eq!(parse_commit_path("/commit:/linux-x64/stable"), None);
        assert_eq!(parse_commit_path("/other"), None);
    }

    #[tokio::test]
    async fn update_endpoint() {
        let srv = start().await;

        let resp = srv
            .client
            .get(format!("{}/api/update/linux-x64/stable/abc", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);

        let resp = srv
            .client
            .get(format!("{}/api/update/linux-x64/stable/older", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        let url = body["url"].as_str().unwrap();
        assert_eq!(
            url,
            format!("{}/artifacts/installers/linux-x64/stable/vscode-1.0.0-abc.tar.gz", srv.base)
        );

        let payload = srv.client.get(url).send().await.unwrap();
        assert_eq!(payload.status(), 200);
        assert_eq!(payload.bytes().await.unwrap().as_ref(), b"installer");

        let resp = srv
            .client
            .get(format!("{}/api/update/amiga/stable/abc", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "unknown_platform");
    }

    #[tokio::test]
    async fn commit_download_redirects() {
        let srv = start().await;
        let resp = srv
            .client
            .get(format!("{}/commit:abc/linux-x64/stable", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 302);
        assert_eq!(
            resp.headers()[header::LOCATION].to_str().unwrap(),
            format!("{}/artifacts/installers/linux-x64/stable/vscode-1.0.0-abc.tar.gz", srv.base)
        );

        let resp = srv
            .client
            .get(format!("{}/commit:nope/linux-x64/stable", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn extension_query_endpoint() {
        let srv = start().await;
        let url = format!("{}/_apis/public/gallery/extensionquery", srv.base);

        let query = serde_json::json!({
            "filters": [{"criteria": [{"filterType": 7, "value": "Acme.Tool"}]}],
            "flags": 0x200,
        });
        let resp = srv.client.post(&url).json(&query).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        let ext = &body["results"][0]["extensions"][0];
        assert_eq!(ext["extensionName"], "tool");
        let vsix = ext["versions"][0]["files"][0]["source"].as_str().unwrap();
        assert!(vsix.starts_with(&format!("{}/artifacts/extensions/acme.tool/1.0.0", srv.base)));

        let download = srv.client.get(vsix).send().await.unwrap();
        assert_eq!(download.status(), 200);
        assert_eq!(download.bytes().await.unwrap().as_ref(), b"vsix-bytes");

        let resp = srv.client.post(&url).body("not json").send().await.unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "invalid_query");

        let bad_id = serde_json::json!({
            "filters": [{"criteria": [{"filterType": 7, "value": "nodot"}]}],
        });
        let resp = srv.client.post(&url).json(&bad_id).send().await.unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "invalid_identifier");
    }

    #[tokio::test]
    async fn static_files_and_passthrough() {
        let srv = start().await;

        let resp = srv
            .client
            .get(format!("{}/extensions/marketplace.json", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(resp.bytes().await.unwrap().as_ref(), br#"{"malicious":["evil.ext"]}"#);

        let recs_url = format!("{}/extensions/workspaceRecommendations.json.gz", srv.base);
        let resp = srv.client.get(&recs_url).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let gz = [0x1f_u8, 0x8b, 0x08, 0x00];
        std::fs::write(StoreLayout::new(srv.dir.path()).recommendations(), gz).unwrap();
        let resp = srv.client.get(&recs_url).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/gzip");
        assert!(resp.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(resp.bytes().await.unwrap().as_ref(), gz);

        for path in ["/artifacts/../etc/passwd", "/artifacts/%2e%2e/secret", "/artifacts/installers"] {
            let resp = srv
                .client
                .get(format!("{}{path}", srv.base))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 404, "{path}");
        }
    }

    #[tokio::test]
    async fn status_and_health() {
        let srv = start().await;

        let health: serde_json::Value = srv
            .client
            .get(format!("{}/healthz", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["generation"], 1);

        let status: serde_json::Value = srv
            .client
            .get(format!("{}/status.json", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["cache"]["extensions"], 1);
        assert_eq!(status["cache"]["malicious"], 1);
        assert_eq!(status["recommended_served"], 1);
        assert!(status["last_sync"].is_null());

        let resp = srv
            .client
            .get(format!("{}/nowhere", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }
}
