//! Work items, outcomes and the persisted run record.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vscmirror_schema::{Channel, ExtensionId};

/// One unit of sync work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkItem {
    /// Latest installer of one platform and channel.
    Binary {
        /// Platform id.
        platform: String,
        /// Channel.
        channel: Channel,
    },
    /// All selected builds of one extension.
    Extension {
        /// Normalized identifier.
        id: ExtensionId,
        /// Came from the recommendations source.
        #[serde(default)]
        recommended: bool,
    },
    /// Enumeration of one extension source.
    Listing {
        /// `recommended`, `popular`, `specified` or `all`.
        source: String,
    },
    /// An identifier that failed validation.
    InvalidIdentifier {
        /// The raw token.
        raw: String,
    },
    /// The marketplace malicious list.
    MaliciousList,
    /// The workspace recommendations file.
    Recommendations,
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary { platform, channel } => write!(f, "binary {platform}/{channel}"),
            Self::Extension { id, .. } => write!(f, "extension {id}"),
            Self::Listing { source } => write!(f, "{source} listing"),
            Self::InvalidIdentifier { raw } => write!(f, "identifier {raw:?}"),
            Self::MaliciousList => f.write_str("malicious list"),
            Self::Recommendations => f.write_str("recommendations"),
        }
    }
}

/// What happened to a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Completed; `wrote` tells whether anything on disk changed.
    Succeeded {
        /// Whether the store was modified.
        wrote: bool,
    },
    /// Deliberately not processed.
    Skipped {
        /// Why.
        reason: String,
    },
    /// Failed; the run continued.
    Failed {
        /// Error class.
        kind: ErrorKind,
        /// Error message.
        reason: String,
    },
}

impl Outcome {
    /// Shorthand for [`Outcome::Skipped`].
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// A work item and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// The item.
    pub item: WorkItem,
    /// Its outcome.
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Counts over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Items that completed.
    pub succeeded: usize,
    /// Items that completed and changed the store.
    pub changed: usize,
    /// Items skipped.
    pub skipped: usize,
    /// Items that failed.
    pub failed: usize,
}

/// Record of one sync invocation, persisted as `sync-state.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobState {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run ended, if it did.
    pub finished_at: Option<DateTime<Utc>>,
    /// Stopped early by a deadline or an interrupt.
    #[serde(default)]
    pub interrupted: bool,
    /// Content-changing writes performed.
    #[serde(default)]
    pub writes: u64,
    /// Per-item results, in completion order.
    #[serde(default)]
    pub items: Vec<ItemRecord>,
}

impl SyncJobState {
    /// Fresh state stamped with the current time.
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            interrupted: false,
            writes: 0,
            items: Vec::new(),
        }
    }

    /// Append a result.
    pub fn record(&mut self, item: WorkItem, outcome: Outcome) {
        self.items.push(ItemRecord { item, outcome });
    }

    /// Stamp the end of the run.
    pub fn finish(&mut self, writes: u64) {
        self.finished_at = Some(Utc::now());
        self.writes = writes;
    }

    /// Count outcomes.
    pub fn summary(&self) -> SyncSummary {
        let mut s = SyncSummary::default();
        for record in &self.items {
            match &record.outcome {
                Outcome::Succeeded { wrote } => {
                    s.succeeded += 1;
                    if *wrote {
                        s.changed += 1;
                    }
                }
                Outcome::Skipped { .. } => s.skipped += 1,
                Outcome::Failed { .. } => s.failed += 1,
            }
        }
        s
    }

    /// Whether any item failed.
    pub fn has_failures(&self) -> bool {
        self.items
            .iter()
            .any(|r| matches!(r.outcome, Outcome::Failed { .. }))
    }

    /// Failed items.
    pub fn failures(&self) -> impl Iterator<Item = &ItemRecord> {
        self.items
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed { .. }))
    }
}
