//! Graceful shutdown on SIGTERM and SIGINT.
//!
//! Cancelling the token stops uploads that have not started yet. An upload
//! already talking to the store is abandoned with its staging file, which
//! the store never lists.

use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    cancel: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(cancel: CancellationToken) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx, cancel }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for SIGTERM or SIGINT, then notify subscribers.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.trigger();
    }

    /// Notify subscribers and cancel pending work.
    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to broadcast shutdown signal: {}", e);
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_notifies_and_cancels() {
        let cancel = CancellationToken::new();
        let child = cancel.child_token();
        let coordinator = ShutdownCoordinator::new(cancel);
        let mut rx = coordinator.subscribe();

        let handle = tokio::spawn(async move {
            rx.recv().await.ok();
        });

        coordinator.trigger();

        handle.await.unwrap();
        assert!(child.is_cancelled());
    }
}
