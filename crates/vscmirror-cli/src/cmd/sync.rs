//! `vscmirror sync`
use std::process::ExitCode;

use anyhow::{Context, Result};
use vscmirror_core::sync::SyncEngine;
use vscmirror_core::sync::state::Outcome;
use vscmirror_core::{MirrorConfig, TracingReporter};

use super::interrupt_token;

/// Run one sync pass, or keep syncing until interrupted when `continuous`.
///
/// A single pass exits non-zero when any item failed.
pub async fn sync(config: &MirrorConfig, continuous: bool) -> Result<ExitCode> {
    let engine = SyncEngine::new(config, TracingReporter).context("Failed to prepare sync")?;
    let platforms: Vec<&str> = engine.platforms().iter().map(|p| p.id).collect();
    tracing::info!(
        artifacts = %config.artifacts.display(),
        platforms = %platforms.join(","),
        continuous,
        "Starting sync"
    );

    let cancel = interrupt_token();
    if continuous {
        engine
            .run_continuous(&cancel)
            .await
            .context("Sync stopped")?;
        return Ok(ExitCode::SUCCESS);
    }

    let state = engine.run_once(&cancel).await.context("Sync failed")?;
    let summary = state.summary();
    println!(
        "{} succeeded ({} changed), {} skipped, {} failed, {} writes{}",
        summary.succeeded,
        summary.changed,
        summary.skipped,
        summary.failed,
        state.writes,
        if state.interrupted { ", interrupted" } else { "" }
    );
    for record in state.failures() {
        if let Outcome::Failed { reason, .. } = &record.outcome {
            println!("  failed: {}: {reason}", record.item);
        }
    }
    Ok(if state.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
