//! Upstream marketplace and CDN calls used by the sync engine.

use crate::config::UpstreamUrls;
use crate::io::fetch::{FetchClient, FetchError, FetchRequest};
use bytes::Bytes;
use flate2::read::GzDecoder;
use serde_json::Value;
use std::io::Read;
use vscmirror_schema::{
    Criterion, ExtensionId, ExtensionQuery, FilterType, GalleryExtension, MARKETPLACE_TARGET,
    QueryFilter, QueryFlags, QueryResponse, SortBy, SortOrder,
};

/// Flags asking for everything needed to mirror an extension's builds.
pub const VERSION_QUERY_FLAGS: QueryFlags = QueryFlags(
    QueryFlags::INCLUDE_VERSIONS.0
        | QueryFlags::INCLUDE_FILES.0
        | QueryFlags::INCLUDE_CATEGORY_AND_TAGS.0
        | QueryFlags::INCLUDE_VERSION_PROPERTIES.0
        | QueryFlags::INCLUDE_ASSET_URI.0
        | QueryFlags::INCLUDE_STATISTICS.0,
);

/// Flags for listing queries, where only identifiers matter.
pub const LISTING_QUERY_FLAGS: QueryFlags = QueryFlags(
    QueryFlags::INCLUDE_LATEST_VERSION_ONLY.0 | QueryFlags::INCLUDE_STATISTICS.0,
);

/// Largest page the marketplace serves.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Hex value of the `Unpublished` flag, used to exclude unpublished entries.
const EXCLUDE_UNPUBLISHED: &str = "4096";

/// Parsed workspace recommendations.
#[derive(Debug, Clone, Default)]
pub struct Recommendations {
    /// The file exactly as served upstream.
    pub raw: Bytes,
    /// Valid identifiers, in first-seen order, de-duplicated.
    pub ids: Vec<ExtensionId>,
    /// Tokens that failed validation.
    pub invalid: Vec<String>,
}

/// Typed wrapper over the upstream endpoints.
#[derive(Debug, Clone, Copy)]
pub struct Marketplace<'a> {
    fetch: &'a FetchClient,
    urls: &'a UpstreamUrls,
}

impl<'a> Marketplace<'a> {
    /// Wrap a fetch client.
    pub fn new(fetch: &'a FetchClient, urls: &'a UpstreamUrls) -> Self {
        Self { fetch, urls }
    }

    fn base_criteria() -> Vec<Criterion> {
        vec![
            Criterion::new(FilterType::Target, MARKETPLACE_TARGET),
            Criterion::new(FilterType::ExcludeWithFlags, EXCLUDE_UNPUBLISHED),
        ]
    }

    /// Run one extension query.
    ///
    /// # Errors
    ///
    /// Any [`FetchError`]; an answer without results is a protocol error.
    pub async fn query(&self, query: &ExtensionQuery) -> Result<QueryResponse, FetchError> {
        let resp: QueryResponse = self
            .fetch
            .gallery_query(&self.urls.marketplace, query)
            .await?;
        if resp.results.is_empty() {
            return Err(FetchError::protocol(
                &self.urls.marketplace,
                "query response has no results",
            ));
        }
        Ok(resp)
    }

    /// Full metadata for one extension, with every version.
    ///
    /// Returns `None` when upstream does not know the extension.
    ///
    /// # Errors
    ///
    /// Any [`FetchError`].
    pub async fn extension(&self, id: &ExtensionId) -> Result<Option<GalleryExtension>, FetchError> {
        let mut criteria = Self::base_criteria();
        criteria.push(Criterion::new(FilterType::ExtensionName, id.as_str()));
        let query = ExtensionQuery {
            filters: vec![QueryFilter {
                criteria,
                page_number: 1,
                page_size: 1,
                ..QueryFilter::default()
            }],
            asset_types: Vec::new(),
            flags: VERSION_QUERY_FLAGS,
        };
        let resp = self.query(&query).await?;
        Ok(resp
            .results
            .into_iter()
            .flat_map(|r| r.extensions)
            .find(|e| e.identifier().is_ok_and(|found| &found == id)))
    }

    /// One page of extensions sorted by install count, most installed first.
    async fn popular_page(
        &self,
        page_number: u32,
        page_size: u32,
    ) -> Result<(Vec<GalleryExtension>, Option<u64>), FetchError> {
        let query = ExtensionQuery {
            filters: vec![QueryFilter {
                criteria: Self::base_criteria(),
                page_number,
                page_size,
                sort_by: SortBy::InstallCount.code(),
                sort_order: SortOrder::Descending.code(),
            }],
            asset_types: Vec::new(),
            flags: LISTING_QUERY_FLAGS,
        };
        let mut resp = self.query(&query).await?;
        let result = resp.results.swap_remove(0);
        let total = result.total_count();
        Ok((result.extensions, total))
    }

    /// Identifiers of the `limit` most-installed extensions.
    ///
    /// # Errors
    ///
    /// Any [`FetchError`].
    pub async fn most_installed(&self, limit: usize) -> Result<Vec<ExtensionId>, FetchError> {
        let page_size = u32::try_from(limit).unwrap_or(MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        self.enumerate(Some(limit), page_size).await
    }

    /// Identifiers of every extension in the marketplace.
    ///
    /// # Errors
    ///
    /// Any [`FetchError`].
    pub async fn all_extensions(&self) -> Result<Vec<ExtensionId>, FetchError> {
        self.enumerate(None, MAX_PAGE_SIZE).await
    }

    pub(crate) async fn enumerate(
        &self,
        limit: Option<usize>,
        page_size: u32,
    ) -> Result<Vec<ExtensionId>, FetchError> {
        let mut ids = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut page = 1;
        loop {
            if limit.is_some_and(|l| ids.len() >= l) {
                break;
            }
            let (extensions, total) = self.popular_page(page, page_size).await?;
            if extensions.is_empty() {
                break;
            }
            let page_len = extensions.len();
            for ext in extensions {
                match ext.identifier() {
                    Ok(id) => {
                        if seen.insert(id.clone()) {
                            ids.push(id);
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "Ignoring listing entry"),
                }
            }
            let fetched = u64::from(page - 1) * u64::from(page_size) + page_len as u64;
            if page_len < page_size as usize || total.is_some_and(|t| fetched >= t) {
                break;
            }
            page += 1;
        }
        if let Some(l) = limit {
            ids.truncate(l);
        }
        Ok(ids)
    }

    /// Fetch and parse the workspace recommendations file.
    ///
    /// # Errors
    ///
    /// Any [`FetchError`]; a body that is not gzipped JSON is a protocol error.
    pub async fn recommendations(&self) -> Result<Recommendations, FetchError> {
        let url = &self.urls.recommendations;
        let resp = self.fetch.fetch(&FetchRequest::get(url.as_str())).await?;
        let mut json = Vec::new();
        GzDecoder::new(&resp.body[..])
            .read_to_end(&mut json)
            .map_err(|e| FetchError::protocol(url, format!("not gzip: {e}")))?;
        let doc: Value = serde_json::from_slice(&json).map_err(|e| FetchError::protocol(url, e))?;
        let (ids, invalid) = parse_recommendations(&doc);
        Ok(Recommendations {
            raw: resp.body,
            ids,
            invalid,
        })
    }

    /// Fetch the marketplace control file (malicious list).
    ///
    /// # Errors
    ///
    /// Any [`FetchError`].
    pub async fn malicious_control(&self) -> Result<Bytes, FetchError> {
        let resp = self
            .fetch
            .fetch(&FetchRequest::get(self.urls.malicious.as_str()))
            .await?;
        Ok(resp.body)
    }
}

/// Collect identifiers from a recommendations document.
///
/// Upstream has shipped both a flat array of identifiers and an array of
/// `{name, recommendations: [...]}` groups; both are accepted.
pub fn parse_recommendations(doc: &Value) -> (Vec<ExtensionId>, Vec<String>) {
    fn walk(v: &Value, out: &mut Vec<String>) {
        match v {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|i| walk(i, out)),
            Value::Object(map) => {
                if let Some(recs) = map.get("recommendations") {
                    walk(recs, out);
                }
            }
            _ => {}
        }
    }

    let mut tokens = Vec::new();
    walk(doc, &mut tokens);

    let mut seen = std::collections::HashSet::new();
    let mut ids = Vec::new();
    let mut invalid = Vec::new();
    for token in tokens {
        match ExtensionId::parse(&token) {
            Ok(id) => {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
            Err(_) => invalid.push(token),
        }
    }
    (ids, invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::retry::RetryPolicy;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tokio_util::sync::CancellationToken;

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn listing(names: &[&str], total: usize) -> String {
        let exts: Vec<_> = names
            .iter()
            .map(|n| {
                let (p, e) = n.split_once('.').unwrap();
                serde_json::json!({"publisher": {"publisherName": p}, "extensionName": e})
            })
            .collect();
        serde_json::json!({"results": [{
            "extensions": exts,
            "resultMetadata": [{"metadataType": "ResultCount", "metadataItems": [{"name": "TotalCount", "count": total}]}]
        }]})
        .to_string()
    }

    #[test]
    fn recommendations_accept_both_shapes() {
        let flat = serde_json::json!(["A.b", "c.d", "a.B", "nope"]);
        let (ids, invalid) = parse_recommendations(&flat);
        assert_eq!(ids.len(), 2);
        assert_eq!(invalid, vec!["nope".to_string()]);

        let grouped = serde_json::json!([
            {"name": "python", "recommendations": ["ms-python.python"]},
            {"name": "go", "recommendations": ["golang.go", "ms-python.python"]}
        ]);
        let (ids, invalid) = parse_recommendations(&grouped);
        let ids: Vec<_> = ids.iter().map(ExtensionId::as_str).collect();
        assert_eq!(ids, vec!["ms-python.python", "golang.go"]);
        assert!(invalid.is_empty());
    }

    #[tokio::test]
    async fn fetches_gzipped_recommendations() {
        let mut server = mockito::Server::new_async().await;
        let body = gz(br#"[{"recommendations": ["golang.go"]}]"#);
        let _m = server
            .mock("GET", "/recs.json.gz")
            .with_status(200)
            .with_body(body.clone())
            .create_async()
            .await;
        let fetch = FetchClient::new("1.95.0", RetryPolicy::no_retry(), CancellationToken::new()).unwrap();
        let urls = UpstreamUrls {
            recommendations: format!("{}/recs.json.gz", server.url()),
            ..UpstreamUrls::default()
        };
        let recs = Marketplace::new(&fetch, &urls).recommendations().await.unwrap();
        assert_eq!(&recs.raw[..], &body[..]);
        assert_eq!(recs.ids[0].as_str(), "golang.go");
    }

    #[tokio::test]
    async fn enumeration_pages_until_limit() {
        let mut server = mockito::Server::new_async().await;
        let page1 = server
            .mock("POST", "/query")
            .match_header("accept", crate::io::fetch::GALLERY_ACCEPT)
            .match_body(mockito::Matcher::Regex(
                r#""pageNumber":1,"pageSize":2,"sortBy":4,"sortOrder":2"#.to_string(),
            ))
            .with_status(200)
            .with_body(listing(&["a.one", "b.two"], 5))
            .create_async()
            .await;
        let page2 = server
            .mock("POST", "/query")
            .match_body(mockito::Matcher::Regex(r#""pageNumber":2,"#.to_string()))
            .with_status(200)
            .with_body(listing(&["c.three", "d.four"], 5))
            .create_async()
            .await;

        let fetch = FetchClient::new("1.95.0", RetryPolicy::no_retry(), CancellationToken::new()).unwrap();
        let urls = UpstreamUrls {
            marketplace: format!("{}/query", server.url()),
            ..UpstreamUrls::default()
        };
        let ids = Marketplace::new(&fetch, &urls)
            .enumerate(Some(3), 2)
            .await
            .unwrap();
        let ids: Vec<_> = ids.iter().map(ExtensionId::as_str).collect();
        assert_eq!(ids, vec!["a.one", "b.two", "c.three"]);
        page1.assert_async().await;
        page2.assert_async().await;
    }

    #[tokio::test]
    async fn enumeration_stops_at_total() {
        let mut server = mockito::Server::new_async().await;
        let only = server
            .mock("POST", "/query")
            .with_status(200)
            .with_body(listing(&["a.one", "b.two"], 2))
            .expect(1)
            .create_async()
            .await;
        let fetch = FetchClient::new("1.95.0", RetryPolicy::no_retry(), CancellationToken::new()).unwrap();
        let urls = UpstreamUrls {
            marketplace: format!("{}/query", server.url()),
            ..UpstreamUrls::default()
        };
        let ids = Marketplace::new(&fetch, &urls).enumerate(None, 2).await.unwrap();
        assert_eq!(ids.len(), 2);
        only.assert_async().await;
    }
}
