//! Sync engine.
//!
//! One run builds a work list (installers for every resolved platform and
//! channel, extensions from the configured sources, the malicious list),
//! drives it through a bounded worker pool, and records the outcome of every
//! item in `sync-state.json`. Per-item failures are recorded and the run goes
//! on; a storage failure stops the run.

pub mod binaries;
pub mod extensions;
pub mod state;
pub mod upstream;

use crate::config::{ConfigError, MirrorConfig, SyncConfig};
use crate::error::ErrorKind;
use crate::io::fetch::{FetchClient, FetchError};
use crate::reporter::Reporter;
use crate::store::{ArtifactStore, AssetLedger, StoreError};
use futures::StreamExt;
use state::{Outcome, SyncJobState, WorkItem};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use upstream::Marketplace;
use vscmirror_schema::{ExtensionId, Platform};

/// Sync failures.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Upstream call failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Local write failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Upstream does not know the item.
    #[error("{0} not found upstream")]
    NotFound(String),

    /// Upstream sent something that cannot be stored.
    #[error("Unusable upstream data: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Classify the failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Store(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Configuration,
            Self::NotFound(_) | Self::Protocol(_) => ErrorKind::UpstreamProtocol,
        }
    }

    /// Whether the run must stop.
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::Cancelled(_)))
    }
}

/// Everything a work item needs, borrowed from the engine for one run.
pub(crate) struct ItemContext<'a, R> {
    pub(crate) config: &'a SyncConfig,
    pub(crate) platforms: &'a [&'static Platform],
    pub(crate) fetch: &'a FetchClient,
    pub(crate) store: &'a ArtifactStore,
    pub(crate) ledger: &'a Mutex<AssetLedger>,
    pub(crate) reporter: &'a R,
}

impl<R> ItemContext<'_, R> {
    pub(crate) fn marketplace(&self) -> Marketplace<'_> {
        Marketplace::new(self.fetch, &self.config.upstream)
    }

    pub(crate) fn with_ledger<T>(&self, f: impl FnOnce(&mut AssetLedger) -> T) -> T {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut ledger)
    }
}

/// Mirrors upstream into the artifact store.
pub struct SyncEngine<R> {
    config: SyncConfig,
    platforms: Vec<&'static Platform>,
    fetch: FetchClient,
    store: ArtifactStore,
    ledger: Mutex<AssetLedger>,
    reporter: R,
}

impl<R> std::fmt::Debug for SyncEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("root", &self.store.layout().root())
            .field("platforms", &self.platforms.len())
            .field("workers", &self.config.workers)
            .finish_non_exhaustive()
    }
}

impl<R: Reporter> SyncEngine<R> {
    /// Validate `config`, resolve the platform set and open the store.
    ///
    /// # Errors
    ///
    /// Configuration problems, store creation failures, or a TLS backend that
    /// cannot be initialised.
    pub fn new(config: &MirrorConfig, reporter: R) -> Result<Self, SyncError> {
        config.validate()?;
        let platforms = config.sync.resolve_platforms()?;
        let store = ArtifactStore::open(config.layout())?;
        let fetch = FetchClient::new(
            &config.sync.masquerade_version,
            config.sync.retry_policy(),
            CancellationToken::new(),
        )?;
        Ok(Self {
            config: config.sync.clone(),
            platforms,
            fetch,
            store,
            ledger: Mutex::new(AssetLedger::default()),
            reporter,
        })
    }

    /// Platforms this engine mirrors, in catalog order.
    pub fn platforms(&self) -> &[&'static Platform] {
        &self.platforms
    }

    /// The store being written.
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Run one pass over the whole work list.
    ///
    /// Stops starting new items when `cancel` fires or the configured
    /// maximum duration elapses; items not reached are recorded as skipped.
    ///
    /// # Errors
    ///
    /// Only fatal errors (storage) are returned; every other failure is
    /// recorded against its item in the returned state.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<SyncJobState, SyncError> {
        let run_cancel = cancel.child_token();
        let deadline = self.config.max_duration().map(|limit| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                tracing::warn!(?limit, "Maximum sync duration reached");
                token.cancel();
            })
        });

        let result = self.run_items(&run_cancel).await;
        if let Some(handle) = deadline {
            handle.abort();
        }
        let mut state = result?;
        state.interrupted = run_cancel.is_cancelled();

        self.reporter.summary(&state);
        self.store
            .write_json_untracked(&self.store.layout().sync_state(), &state)?;
        Ok(state)
    }

    async fn run_items(&self, cancel: &CancellationToken) -> Result<SyncJobState, SyncError> {
        let mut state = SyncJobState::start();
        let writes_before = self.store.writes();
        let fetch = self.fetch.with_cancel(cancel.clone());

        {
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            *ledger = AssetLedger::load(&self.store.layout().ledger());
            let pruned = ledger.prune_missing(self.store.layout().root());
            if pruned > 0 {
                tracing::info!(pruned, "Dropped ledger entries for missing files");
            }
        }

        let ctx = ItemContext {
            config: &self.config,
            platforms: &self.platforms,
            fetch: &fetch,
            store: &self.store,
            ledger: &self.ledger,
            reporter: &self.reporter,
        };

        self.reporter.phase("Building work list");
        let mut items = Vec::new();
        if self.config.binaries {
            for platform in &self.platforms {
                for channel in &self.config.channels {
                    items.push(WorkItem::Binary {
                        platform: platform.id.to_string(),
                        channel: *channel,
                    });
                }
            }
        }
        items.extend(self.extension_items(&ctx, &mut state).await?);
        items.push(WorkItem::MaliciousList);

        self.reporter
            .phase(&format!("Syncing {} items with {} workers", items.len(), self.config.workers));
        let ctx = &ctx;
        let mut results = futures::stream::iter(items)
            .map(|item| async move {
                if cancel.is_cancelled() {
                    return (item, Err(None));
                }
                ctx.reporter.item_started(&item);
                let result = process(ctx, &item).await;
                (item, result.map_err(Some))
            })
            .buffer_unordered(self.config.workers.max(1));

        while let Some((item, result)) = results.next().await {
            let outcome = match result {
                Ok(wrote) => Outcome::Succeeded { wrote },
                Err(None) => Outcome::skipped("interrupted"),
                Err(Some(e)) if e.is_cancelled() => Outcome::skipped("interrupted"),
                Err(Some(e)) if e.is_fatal() => {
                    tracing::error!(%item, error = %e, "Aborting sync");
                    return Err(e);
                }
                Err(Some(e)) => Outcome::Failed {
                    kind: e.kind(),
                    reason: e.to_string(),
                },
            };
            self.reporter.item_finished(&item, &outcome);
            state.record(item, outcome);
        }
        drop(results);

        let saved = ctx.with_ledger(|ledger| ledger.save(&self.store))?;
        if saved {
            tracing::debug!("Asset ledger updated");
        }
        state.finish(self.store.writes() - writes_before);
        Ok(state)
    }

    /// Extension items from every enabled source, de-duplicated.
    ///
    /// Listing failures are recorded against a [`WorkItem::Listing`] item and
    /// the remaining sources still contribute.
    async fn extension_items(
        &self,
        ctx: &ItemContext<'_, R>,
        state: &mut SyncJobState,
    ) -> Result<Vec<WorkItem>, SyncError> {
        let sources = self.config.extensions;
        let mut list = ExtensionList::default();
        let market = ctx.marketplace();

        if sources.recommended {
            match market.recommendations().await {
                Ok(recs) => {
                    let wrote = self
                        .store
                        .write_if_changed(&self.store.layout().recommendations(), &recs.raw)?;
                    state.record(WorkItem::Recommendations, Outcome::Succeeded { wrote });
                    list.extend_invalid(state, recs.invalid);
                    for id in recs.ids {
                        list.push(id, true);
                    }
                }
                Err(e) => record_failure(state, WorkItem::Recommendations, &e.into()),
            }
            if self.config.total_recommended > 0 {
                match market.most_installed(self.config.total_recommended).await {
                    Ok(ids) => ids.into_iter().for_each(|id| list.push(id, false)),
                    Err(e) => record_failure(state, listing("popular"), &e.into()),
                }
            }
        }

        if sources.specified {
            if let Some(path) = &self.config.specified_file {
                match read_specified(path) {
                    Ok(tokens) => list.extend_tokens(state, tokens),
                    Err(e) => record_failure(state, listing("specified"), &e),
                }
            }
        }

        if sources.all {
            match market.all_extensions().await {
                Ok(ids) => ids.into_iter().for_each(|id| list.push(id, false)),
                Err(e) => record_failure(state, listing("all"), &e.into()),
            }
        }

        tracing::info!(extensions = list.items.len(), "Extension work list built");
        Ok(list.into_items())
    }

    /// Run forever: sync, sleep `frequency`, repeat, until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Stops at the first fatal error.
    pub async fn run_continuous(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        loop {
            let state = self.run_once(cancel).await?;
            if state.has_failures() {
                tracing::warn!(failed = state.summary().failed, "Sync run had failures");
            }
            if cancel.is_cancelled() {
                return Ok(());
            }
            let pause = self.config.frequency();
            tracing::info!(?pause, "Sleeping until next sync");
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                () = cancel.cancelled() => return Ok(()),
            }
        }
    }
}

async fn process<R: Reporter>(ctx: &ItemContext<'_, R>, item: &WorkItem) -> Result<bool, SyncError> {
    match item {
        WorkItem::Binary { platform, channel } => {
            let platform = Platform::lookup(platform).map_err(ConfigError::from)?;
            binaries::sync_binary(ctx, platform, *channel).await
        }
        WorkItem::Extension { id, recommended } => {
            extensions::sync_extension(ctx, id, *recommended).await
        }
        WorkItem::MaliciousList => extensions::sync_malicious_list(ctx).await,
        WorkItem::Recommendations | WorkItem::Listing { .. } | WorkItem::InvalidIdentifier { .. } => {
            Ok(false)
        }
    }
}

fn listing(source: &str) -> WorkItem {
    WorkItem::Listing {
        source: source.to_string(),
    }
}

fn record_failure(state: &mut SyncJobState, item: WorkItem, err: &SyncError) {
    if err.is_cancelled() {
        state.record(item, Outcome::skipped("interrupted"));
        return;
    }
    tracing::warn!(%item, error = %err, "Listing failed");
    state.record(
        item,
        Outcome::Failed {
            kind: err.kind(),
            reason: err.to_string(),
        },
    );
}

/// Read an identifier list: a JSON array of strings, or one identifier per
/// line with `#` comments.
fn read_specified(path: &Path) -> Result<Vec<String>, SyncError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::invalid("sync.specified_file", format!("{}: {e}", path.display()))
    })?;
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(&text).map_err(|e| {
            ConfigError::invalid("sync.specified_file", format!("{}: {e}", path.display())).into()
        });
    }
    Ok(text
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Work list under construction, first-seen order.
#[derive(Default)]
struct ExtensionList {
    items: Vec<(ExtensionId, bool)>,
    index: HashMap<ExtensionId, usize>,
}

impl ExtensionList {
    fn push(&mut self, id: ExtensionId, recommended: bool) {
        if let Some(&i) = self.index.get(&id) {
            self.items[i].1 |= recommended;
            return;
        }
        self.index.insert(id.clone(), self.items.len());
        self.items.push((id, recommended));
    }

    fn extend_tokens(&mut self, state: &mut SyncJobState, tokens: Vec<String>) {
        let mut invalid = Vec::new();
        for token in tokens {
            match ExtensionId::parse(&token) {
                Ok(id) => self.push(id, false),
                Err(_) => invalid.push(token),
            }
        }
        self.extend_invalid(state, invalid);
    }

    fn extend_invalid(&mut self, state: &mut SyncJobState, invalid: Vec<String>) {
        for raw in invalid {
            let reason = ExtensionId::parse(&raw)
                .err()
                .map_or_else(|| "malformed identifier".to_string(), |e| e.to_string());
            tracing::warn!(raw, %reason, "Skipping identifier");
            state.record(WorkItem::InvalidIdentifier { raw }, Outcome::skipped(reason));
        }
    }

    fn into_items(self) -> Vec<WorkItem> {
        self.items
            .into_iter()
            .map(|(id, recommended)| WorkItem::Extension { id, recommended })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamUrls;
    use crate::reporter::NullReporter;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn specified_file_formats() {
        let dir = TempDir::new().unwrap();
        let lines = dir.path().join("list.txt");
        std::fs::write(&lines, "# header\nms-python.python\n\n  golang.go  # go\n").unwrap();
        assert_eq!(read_specified(&lines).unwrap(), vec!["ms-python.python", "golang.go"]);

        let json = dir.path().join("list.json");
        std::fs::write(&json, r#"["a.b", "c.d"]"#).unwrap();
        assert_eq!(read_specified(&json).unwrap(), vec!["a.b", "c.d"]);
    }

    #[test]
    fn work_list_dedupes_case_insensitively() {
        let mut state = SyncJobState::start();
        let mut list = ExtensionList::default();
        list.extend_tokens(
            &mut state,
            vec!["A.B".into(), "a.b".into(), "nodot".into(), "c.d".into()],
        );
        list.push(ExtensionId::parse("c.D").unwrap(), true);
        let items = list.into_items();
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1],
            WorkItem::Extension {
                id: ExtensionId::parse("c.d").unwrap(),
                recommended: true
            }
        );
        assert_eq!(state.summary().skipped, 1);
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn extension_body(base: &str) -> String {
        serde_json::json!({
            "results": [{
                "extensions": [{
                    "publisher": {"publisherId": "p1", "publisherName": "acme", "displayName": "Acme"},
                    "extensionId": "e1",
                    "extensionName": "tool",
                    "displayName": "Tool",
                    "shortDescription": "A tool",
                    "flags": "validated",
                    "versions": [{
                        "version": "1.0.0",
                        "lastUpdated": "2024-01-01T00:00:00Z",
                        "files": [{
                            "assetType": "Microsoft.VisualStudio.Services.VSIXPackage",
                            "source": format!("{base}/assets/acme.tool/1.0.0/vsix")
                        }],
                        "properties": [],
                        "assetUri": format!("{base}/assets/acme.tool/1.0.0"),
                        "fallbackAssetUri": format!("{base}/assets/acme.tool/1.0.0")
                    }],
                    "statistics": [{"statisticName": "install", "value": 10.0}]
                }],
                "resultMetadata": [{
                    "metadataType": "ResultCount",
                    "metadataItems": [{"name": "TotalCount", "count": 1}]
                }]
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn second_run_against_unchanged_upstream_writes_nothing() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let payload = b"installer bytes";
        let digest = vscmirror_schema::Sha256Digest::of(payload);
        let commit = "c0ffee";

        let update = server
            .mock("GET", "/api/update/linux-x64/stable/latest")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "url": format!("{base}/dl/code.tar.gz"),
                    "name": "1.95.3",
                    "version": commit,
                    "productVersion": "1.95.3",
                    "timestamp": 1_700_000_000_000_i64,
                    "sha256hash": digest.as_str(),
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let up_to_date = server
            .mock("GET", format!("/api/update/linux-x64/stable/{commit}").as_str())
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        let _m1 = server
            .mock("GET", "/dl/code.tar.gz")
            .with_status(200)
            .with_body(payload)
            .create_async()
            .await;
        let vsix = server
            .mock("GET", "/assets/acme.tool/1.0.0/vsix")
            .with_status(200)
            .with_body("vsix bytes")
            .expect(1)
            .create_async()
            .await;
        let _m2 = server
            .mock("POST", "/query")
            .with_status(200)
            .with_body(extension_body(&base))
            .create_async()
            .await;
        let _m3 = server
            .mock("GET", "/recs.json.gz")
            .with_status(200)
            .with_body(gzip(br#"["acme.tool", "bogus"]"#))
            .create_async()
            .await;
        let _m4 = server
            .mock("GET", "/marketplace.json")
            .with_status(200)
            .with_body(r#"{"malicious": ["evil.ext"]}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let mut config = MirrorConfig {
            artifacts: dir.path().to_path_buf(),
            ..MirrorConfig::default()
        };
        config.sync.platforms = vec!["linux-x64".into()];
        config.sync.total_recommended = 5;
        config.sync.workers = 2;
        config.sync.upstream = UpstreamUrls {
            update: format!("{base}/api/update"),
            marketplace: format!("{base}/query"),
            recommendations: format!("{base}/recs.json.gz"),
            malicious: format!("{base}/marketplace.json"),
        };

        let engine = SyncEngine::new(&config, NullReporter).unwrap();
        let cancel = CancellationToken::new();

        let first = engine.run_once(&cancel).await.unwrap();
        assert!(!first.has_failures(), "{:?}", first.items);
        assert!(first.writes > 0);
        assert_eq!(first.summary().skipped, 1);
        let layout = engine.store().layout();
        assert!(layout.installers().join("linux-x64/stable/vscode-1.95.3-c0ffee.tar.gz").is_file());
        assert!(layout.installers().join("linux-x64/stable/c0ffee.json").is_file());
        assert!(
            layout
                .extensions()
                .join("acme.tool/1.0.0/Microsoft.VisualStudio.Services.VSIXPackage")
                .is_file()
        );
        assert!(layout.malicious().is_file());

        let second = engine.run_once(&cancel).await.unwrap();
        assert!(!second.has_failures(), "{:?}", second.items);
        assert_eq!(second.writes, 0);
        assert_eq!(second.summary().changed, 0);

        update.assert_async().await;
        up_to_date.assert_async().await;
        vsix.assert_async().await;
    }

    #[tokio::test]
    async fn cancelled_run_skips_everything() {
        let dir = TempDir::new().unwrap();
        let mut config = MirrorConfig {
            artifacts: dir.path().to_path_buf(),
            ..MirrorConfig::default()
        };
        config.sync.platforms = vec!["linux-x64".into()];
        config.sync.extensions.recommended = false;
        let engine = SyncEngine::new(&config, NullReporter).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let state = engine.run_once(&cancel).await.unwrap();
        assert!(state.interrupted);
        assert_eq!(state.summary().skipped, 2);
        assert_eq!(state.writes, 0);
        assert!(layout_has_state(engine.store().layout().root()));
    }

    fn layout_has_state(root: &Path) -> bool {
        root.join("sync-state.json").is_file()
    }
}
