//! `vscmirror serve`
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use vscmirror_core::MirrorConfig;
use vscmirror_core::cache::{CacheOptions, MetadataCache};
use vscmirror_core::gallery::Gallery;

use super::interrupt_token;
use crate::server;

/// Start the metadata cache and serve the gallery until Ctrl-C.
pub async fn serve(config: &MirrorConfig) -> Result<()> {
    let layout = config.layout();
    let addr: SocketAddr = config
        .gallery
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address '{}'", config.gallery.listen))?;

    let cancel = interrupt_token();
    let options = CacheOptions::from_config(&config.gallery, &layout);
    let cache = MetadataCache::start(layout.clone(), options, &cancel)
        .await
        .context("Failed to start the metadata cache")?;
    let cache = Arc::new(cache);
    let gallery = Arc::new(Gallery::new(Arc::clone(&cache), layout, &config.gallery));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(
        %addr,
        url_root = %config.gallery.url_root,
        artifacts = %config.artifacts.display(),
        "Serving gallery"
    );

    axum::serve(listener, server::router(gallery))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Server error")?;

    cache.shutdown();
    tracing::info!("Server stopped");
    Ok(())
}
