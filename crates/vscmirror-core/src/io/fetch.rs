//! Resilient HTTP transport.
//!
//! Every upstream call goes through [`FetchClient`]. Transient failures
//! (connect/timeout/body errors, 5xx, 429) are retried according to the
//! [`RetryPolicy`]; anything else is returned immediately, classified.

use crate::error::ErrorKind;
use crate::io::retry::RetryPolicy;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Marketplace API version header value.
pub const GALLERY_ACCEPT: &str = "application/json;api-version=3.0-preview.1";

/// Upstream transport failures.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Connection, timeout or body-read failure.
    #[error("Request to {url} failed: {source}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// HTTP 429.
    #[error("Rate limited by {url} (retry after {retry_after:?})")]
    RateLimited {
        /// Requested URL.
        url: String,
        /// Parsed `Retry-After`, if any.
        retry_after: Option<Duration>,
    },

    /// HTTP 5xx.
    #[error("{url} returned server error {status}")]
    Server {
        /// Requested URL.
        url: String,
        /// Status code.
        status: u16,
    },

    /// Any other non-success status.
    #[error("{url} returned HTTP {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// Status code.
        status: u16,
    },

    /// A response that cannot be used as-is.
    #[error("Malformed response from {url}: {reason}")]
    Protocol {
        /// Requested URL.
        url: String,
        /// What was wrong.
        reason: String,
    },

    /// Downloaded bytes do not match the advertised digest.
    #[error("Checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Requested URL.
        url: String,
        /// Advertised digest.
        expected: String,
        /// Computed digest.
        actual: String,
    },

    /// Writing a downloaded payload failed.
    #[error("Failed to write {path}: {source}")]
    Io {
        /// Destination path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The caller's cancellation token fired.
    #[error("Request to {0} cancelled")]
    Cancelled(String),
}

impl FetchError {
    /// Classify the failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { source, .. } => {
                if source.is_builder() || source.is_decode() || source.is_redirect() {
                    ErrorKind::UpstreamProtocol
                } else {
                    ErrorKind::TransientNetwork
                }
            }
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Server { .. } => ErrorKind::TransientNetwork,
            Self::Status { .. }
            | Self::Protocol { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Cancelled(_) => ErrorKind::UpstreamProtocol,
            Self::Io { .. } => ErrorKind::Storage,
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Server-advertised delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Status code for status-based failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } | Self::Status { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub(crate) fn protocol(url: &str, reason: impl std::fmt::Display) -> Self {
        Self::Protocol {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A request description. Cheap to clone so each attempt rebuilds it.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Extra headers.
    pub headers: Vec<(reqwest::header::HeaderName, String)>,
    /// Request body.
    pub body: Option<Bytes>,
}

impl FetchRequest {
    /// `GET url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// `POST url` with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if `body` cannot be serialized.
    pub fn post_json<T: Serialize>(url: impl Into<String>, body: &T) -> Result<Self, FetchError> {
        let url = url.into();
        let bytes = serde_json::to_vec(body).map_err(|e| FetchError::protocol(&url, e))?;
        Ok(Self {
            method: Method::POST,
            url,
            headers: vec![(CONTENT_TYPE, "application/json".to_string())],
            body: Some(Bytes::from(bytes)),
        })
    }

    /// Add a header.
    pub fn header(mut self, name: reqwest::header::HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

/// A successful response, body fully read.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Status code (2xx).
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Body. Empty for 204.
    pub body: Bytes,
}

impl FetchResponse {
    /// Whether upstream answered 204 No Content.
    pub fn is_no_content(&self) -> bool {
        self.status == StatusCode::NO_CONTENT
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Map a non-success status to its error.
pub(crate) fn status_error(url: &str, status: StatusCode, headers: &HeaderMap) -> FetchError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        FetchError::RateLimited {
            url: url.to_string(),
            retry_after,
        }
    } else if status.is_server_error() {
        FetchError::Server {
            url: url.to_string(),
            status: status.as_u16(),
        }
    } else {
        FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        }
    }
}

/// HTTP client with retry, backoff and rate-limit handling.
#[derive(Debug, Clone)]
pub struct FetchClient {
    client: Client,
    policy: RetryPolicy,
    user_agent: String,
    cancel: CancellationToken,
}

impl FetchClient {
    /// Build a client presenting itself as the given editor version.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the TLS backend cannot be initialised.
    pub fn new(
        masquerade_version: &str,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(120))
            .build()
            .map_err(|source| FetchError::Transport {
                url: String::new(),
                source,
            })?;
        Ok(Self {
            client,
            policy,
            user_agent: format!("VSCode {masquerade_version}"),
            cancel,
        })
    }

    /// `User-Agent` sent with every request.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Retry policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    /// Same client, stopped by a different token.
    #[must_use]
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Send `req`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the last error once the policy gives up, or the first
    /// non-retryable error.
    pub async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.with_retry(&req.url, || self.send_once(req)).await
    }

    /// Send `req` and decode a JSON body.
    ///
    /// # Errors
    ///
    /// As [`FetchClient::fetch`]; an undecodable or empty body is a protocol error.
    pub async fn fetch_json<T: DeserializeOwned>(&self, req: &FetchRequest) -> Result<T, FetchError> {
        let resp = self.fetch(req).await?;
        if resp.is_no_content() {
            return Err(FetchError::protocol(&req.url, "expected a JSON body, got 204"));
        }
        serde_json::from_slice(&resp.body).map_err(|e| FetchError::protocol(&req.url, e))
    }

    /// POST a marketplace query and decode the answer.
    ///
    /// # Errors
    ///
    /// As [`FetchClient::fetch_json`].
    pub async fn gallery_query<Q: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        query: &Q,
    ) -> Result<T, FetchError> {
        let req = FetchRequest::post_json(url, query)?.header(ACCEPT, GALLERY_ACCEPT);
        self.fetch_json(&req).await
    }

    async fn send_once(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut builder = self
            .client
            .request(req.method.clone(), &req.url)
            .header(USER_AGENT, &self.user_agent);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().await.map_err(|source| FetchError::Transport {
            url: req.url.clone(),
            source,
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(&req.url, status, resp.headers()));
        }
        let headers = resp.headers().clone();
        let body = if status == StatusCode::NO_CONTENT {
            Bytes::new()
        } else {
            resp.bytes().await.map_err(|source| FetchError::Transport {
                url: req.url.clone(),
                source,
            })?
        };
        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }

    /// Run `op` until it succeeds, fails permanently, or the policy gives up.
    pub(crate) async fn with_retry<T, F, Fut>(&self, url: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled(url.to_string()));
            }
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            let sample: f64 = rand::rng().random();
            let Some(delay) =
                self.policy
                    .delay_for(attempt, started.elapsed(), err.retry_after(), sample)
            else {
                tracing::warn!(url, attempt, error = %err, "Giving up");
                return Err(err);
            };
            tracing::debug!(url, attempt, ?delay, error = %err, "Retrying");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => return Err(FetchError::Cancelled(url.to_string())),
            }
        }
    }
}
