//! Ctrl-C / SIGTERM handling.
//!
//! A signal cancels the coordinator's token. Upload checks it between chunks;
//! restore stops dispatching and lets in-flight nodes finish, so a cancelled
//! run never leaves a half-written file behind.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that fires once shutdown starts
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start shutdown without waiting for a signal
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Spawn a task that triggers shutdown on the first SIGINT or SIGTERM.
    pub fn listen(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.wait_for_signal().await;
            coordinator.trigger();
        })
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT)
    async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), stopping after in-flight work...");
            }
            _ = terminate => {
                info!("Received SIGTERM, stopping after in-flight work...");
            }
            _ = self.token.cancelled() => {}
        }
    }
}
