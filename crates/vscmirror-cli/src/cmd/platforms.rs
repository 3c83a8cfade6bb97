//! List the platform catalog
use anyhow::{Context, Result};
use vscmirror_core::MirrorConfig;
use vscmirror_schema::Platform;

/// Print the catalog, or only the platforms `config` resolves to.
pub fn platforms(config: Option<&MirrorConfig>) -> Result<()> {
    let list: Vec<&'static Platform> = match config {
        Some(config) => config
            .sync
            .resolve_platforms()
            .context("Failed to resolve platforms")?,
        None => Platform::catalog().iter().collect(),
    };
    for p in list {
        println!(
            "{:<22} {:<8} {:<8} {:<10} {}",
            p.id,
            p.category.as_str(),
            p.os.as_str(),
            p.arch.as_str(),
            p.extension_targets.join(",")
        );
    }
    Ok(())
}
