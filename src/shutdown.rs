//! Graceful shutdown signalling
//!
//! Installs a Ctrl+C / SIGTERM handler and exposes a [`CancellationToken`]
//! that every long-running task (SIP loop, RTP loop, cleanup ticker)
//! selects on so in-flight handler bodies run to completion before the
//! process exits.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Spawn a task that cancels the returned token on SIGINT or SIGTERM.
pub fn install() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down"),
            _ = terminate => info!("received SIGTERM, shutting down"),
        }

        child.cancel();
    });

    token
}
