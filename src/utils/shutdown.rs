//! Process shutdown
//!
//! SIGTERM, Ctrl+C and programmatic requests all cancel one token that the
//! hub's background tasks watch.

use std::fmt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What ended the wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "Ctrl+C"),
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Requested => write!(f, "shutdown request"),
        }
    }
}

#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once shutdown begins; hand one to each background task.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn request_shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Block until a signal arrives or shutdown is requested, then cancel
    /// every token handed out.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
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

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let reason = tokio::select! {
            _ = ctrl_c => ShutdownReason::Interrupt,
            _ = terminate => ShutdownReason::Terminate,
            _ = self.token.cancelled() => ShutdownReason::Requested,
        };

        info!("Shutting down hub ({})", reason);
        self.token.cancel();
        reason
    }
}
