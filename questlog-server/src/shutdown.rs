//! Signal handling for graceful shutdown.

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

/// Creates a future that completes when a shutdown signal is received.
///
/// Listens for SIGTERM and SIGINT (Ctrl+C). If the handlers cannot be
/// installed only Ctrl+C is honoured.
pub async fn shutdown_signal() {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("Failed to install signal handlers: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
}

/// Spawns a task that flips the returned channel to `true` on the first
/// shutdown signal.
///
/// Background loops hold a receiver; the HTTP server waits on
/// [`wait_for_shutdown`].
pub fn spawn_shutdown_broadcaster() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tx.send_replace(true);
    });
    (shutdown_tx, shutdown_rx)
}

/// Resolves once the shutdown flag is set or every sender is gone.
pub async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    // An error means the sender was dropped, which also ends the process
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}
