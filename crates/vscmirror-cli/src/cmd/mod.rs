//! Subcommand implementations

pub mod platforms;
pub mod serve;
pub mod status;
pub mod sync;

use tokio_util::sync::CancellationToken;

/// Token cancelled on the first Ctrl-C.
pub(crate) fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight work");
            trigger.cancel();
        }
    });
    token
}
