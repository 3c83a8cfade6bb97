//! Reporter trait for dependency injection
//!
//! Lets the sync engine report progress without being coupled to how the
//! caller presents it. The CLI uses [`TracingReporter`]; tests use
//! [`NullReporter`].

use crate::sync::state::{Outcome, SyncJobState, WorkItem};

/// Receives sync progress events.
pub trait Reporter: Send + Sync {
    /// A new phase started (e.g. "Building work list").
    fn phase(&self, title: &str);

    /// Work on an item started.
    fn item_started(&self, item: &WorkItem);

    /// Work on an item ended.
    fn item_finished(&self, item: &WorkItem, outcome: &Outcome);

    /// A payload finished downloading.
    fn downloaded(&self, url: &str, bytes: u64);

    /// The run ended.
    fn summary(&self, state: &SyncJobState);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn phase(&self, title: &str) {
        (**self).phase(title);
    }
    fn item_started(&self, item: &WorkItem) {
        (**self).item_started(item);
    }
    fn item_finished(&self, item: &WorkItem, outcome: &Outcome) {
        (**self).item_finished(item, outcome);
    }
    fn downloaded(&self, url: &str, bytes: u64) {
        (**self).downloaded(url, bytes);
    }
    fn summary(&self, state: &SyncJobState) {
        (**self).summary(state);
    }
}

/// A no-op reporter for silent operations (e.g., testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn phase(&self, _: &str) {}
    fn item_started(&self, _: &WorkItem) {}
    fn item_finished(&self, _: &WorkItem, _: &Outcome) {}
    fn downloaded(&self, _: &str, _: u64) {}
    fn summary(&self, _: &SyncJobState) {}
}

/// Reports through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn phase(&self, title: &str) {
        tracing::info!("{title}");
    }

    fn item_started(&self, item: &WorkItem) {
        tracing::debug!(%item, "Started");
    }

    fn item_finished(&self, item: &WorkItem, outcome: &Outcome) {
        match outcome {
            Outcome::Succeeded { wrote: true } => tracing::info!(%item, "Updated"),
            Outcome::Succeeded { wrote: false } => tracing::debug!(%item, "Up to date"),
            Outcome::Skipped { reason } => tracing::info!(%item, %reason, "Skipped"),
            Outcome::Failed { kind, reason } => {
                tracing::warn!(%item, %kind, %reason, "Failed");
            }
        }
    }

    fn downloaded(&self, url: &str, bytes: u64) {
        tracing::debug!(url, bytes, "Downloaded");
    }

    fn summary(&self, state: &SyncJobState) {
        let s = state.summary();
        tracing::info!(
            succeeded = s.succeeded,
            changed = s.changed,
            skipped = s.skipped,
            failed = s.failed,
            writes = state.writes,
            interrupted = state.interrupted,
            "Sync finished"
        );
    }
}
