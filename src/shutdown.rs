//! Graceful Shutdown Module
//!
//! Coordinates shutdown of the HTTP surface and the singleton background
//! tasks. Components subscribe to a broadcast channel; on SIGINT/SIGTERM
//! the coordinator fans the signal out, the flusher drains its pending
//! deltas, and the main task bounds the whole sequence with a timeout.

use crate::{QuotaError, Result};
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

/// Fans a single shutdown signal out to every subscribed component.
pub struct ShutdownCoordinator {
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);
        Self {
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Signal handle for a component to wait on.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.shutdown_sender.subscribe())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Broadcast shutdown to all subscribers.
    pub fn signal_shutdown(&self) {
        // Send fails only when no receiver is subscribed, which means
        // every component already exited.
        let _ = self.shutdown_sender.send(());
    }

    /// Block until SIGINT or SIGTERM arrives, then broadcast shutdown.
    pub async fn listen_for_signals(&self) -> Result<()> {
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                QuotaError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;
        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                QuotaError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.signal_shutdown();
        Ok(())
    }
}

/// Per-component shutdown receiver.
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    /// Check if shutdown has been requested (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for the shutdown broadcast. A closed or lagged channel also
    /// counts as shutdown so components never hang on a dead coordinator.
    pub async fn wait_for_shutdown(&mut self) {
        match self.receiver.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                self.shutdown_requested = true;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                self.shutdown_requested = true;
            }
        }
    }
}
