//! Status command: store contents and the last sync outcome
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use vscmirror_core::MirrorConfig;
use vscmirror_core::cache::{CacheOptions, MetadataCache};
use vscmirror_core::gallery::Gallery;
use vscmirror_core::gallery::status::GalleryStatus;

/// Scan the store without persisting anything and print what a running
/// gallery would report at `/status.json`.
pub async fn status(config: &MirrorConfig, json: bool) -> Result<()> {
    let layout = config.layout();
    let options = CacheOptions {
        cache_dir: None,
        refresh_interval: config.gallery.refresh_interval(),
        debounce: config.gallery.debounce(),
        watch: false,
    };
    let cancel = CancellationToken::new();
    let cache = MetadataCache::start(layout.clone(), options, &cancel)
        .await
        .context("Failed to scan the artifact store")?;
    let gallery = Gallery::new(Arc::new(cache), layout, &config.gallery);
    let status = gallery.status();
    cancel.cancel();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(config, &status);
    }
    Ok(())
}

fn print_status(config: &MirrorConfig, status: &GalleryStatus) {
    let label_width = 12;
    let counts = &status.cache.counts;
    println!("{:<label_width$} {}", "Version", status.version);
    println!("{:<label_width$} {}", "Store", config.artifacts.display());
    println!(
        "{:<label_width$} {} ({} custom, {} recommended, {} builds)",
        "Extensions", counts.extensions, counts.custom, counts.recommended, counts.versions
    );
    println!("{:<label_width$} {}", "Publishers", counts.publishers);
    println!("{:<label_width$} {}", "Malicious", counts.malicious);

    let Some(last) = &status.last_sync else {
        println!("{:<label_width$} never", "Last sync");
        return;
    };
    let finished = last.finished_at.map_or_else(
        || "did not finish".to_string(),
        |t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        },
    );
    println!(
        "{:<label_width$} {finished}{}",
        "Last sync",
        if last.interrupted { " (interrupted)" } else { "" }
    );
    let s = &last.summary;
    println!(
        "{:<label_width$} {} succeeded ({} changed), {} skipped, {} failed",
        "Outcome", s.succeeded, s.changed, s.skipped, s.failed
    );
    for record in &last.failures {
        println!("{:<label_width$} {}", "", record.item);
    }
}
