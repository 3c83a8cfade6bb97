//! Read-only status projection for monitoring.

use crate::cache::CacheStats;
use crate::config::MaliciousPolicy;
use crate::gallery::Gallery;
use crate::gallery::query::recommended_ids;
use crate::store::read_json;
use crate::sync::state::{ItemRecord, SyncJobState, SyncSummary};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Failures listed in the status document; the rest are only counted.
const MAX_LISTED_FAILURES: usize = 50;

/// Outcome of the most recent sync run, as read from `sync-state.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastSync {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When it ended; `None` while running or after a crash.
    pub finished_at: Option<DateTime<Utc>>,
    /// Stopped by a deadline or an interrupt.
    pub interrupted: bool,
    /// Content-changing writes.
    pub writes: u64,
    /// Outcome counts.
    pub summary: SyncSummary,
    /// The first failed items.
    pub failures: Vec<ItemRecord>,
}

impl From<SyncJobState> for LastSync {
    fn from(state: SyncJobState) -> Self {
        let summary = state.summary();
        let failures = state.failures().take(MAX_LISTED_FAILURES).cloned().collect();
        Self {
            started_at: state.started_at,
            finished_at: state.finished_at,
            interrupted: state.interrupted,
            writes: state.writes,
            summary,
            failures,
        }
    }
}

/// The `/status.json` document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalleryStatus {
    /// Server version.
    pub version: &'static str,
    /// When this document was produced.
    pub generated_at: DateTime<Utc>,
    /// Public base URL.
    pub url_root: String,
    /// Treatment of malicious extensions.
    pub malicious_policy: MaliciousPolicy,
    /// Metadata cache health.
    pub cache: CacheStats,
    /// Recommended extensions an empty search returns.
    pub recommended_served: usize,
    /// Last sync run, if any ran against this store.
    pub last_sync: Option<LastSync>,
}

impl Gallery {
    /// Build the status document. Never triggers a sync or a rebuild.
    pub fn status(&self) -> GalleryStatus {
        let snapshot = self.cache().current();
        let policy = self.policy;
        let path = self.layout().sync_state();
        let last_sync = match read_json::<SyncJobState>(&path) {
            Ok(state) => state.map(LastSync::from),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable sync state");
                None
            }
        };
        GalleryStatus {
            version: crate::VERSION,
            generated_at: Utc::now(),
            url_root: self.url_root().to_string(),
            malicious_policy: policy,
            cache: self.cache().stats(),
            recommended_served: recommended_ids(&snapshot, policy).len(),
            last_sync,
        }
    }
}
