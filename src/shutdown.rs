//! Graceful Shutdown Module
//!
//! Handles signal-driven shutdown: components subscribe to a broadcast channel and
//! stop accepting work, then the proxy worker drains its queue and disconnects from
//! the database and the cache store within the configured timeout.

use crate::task_queue::ProxyHandle;
use crate::{ProxyError, Result};
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    proxy_handle: Option<ProxyHandle>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            proxy_handle: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Set the handle of the worker to drain on shutdown
    pub fn set_proxy_handle(&mut self, handle: ProxyHandle) {
        self.proxy_handle = Some(handle);
    }

    /// Get a shutdown signal for a component
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.shutdown_sender.subscribe())
    }

    /// Wait for SIGINT or SIGTERM, then shut down
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;
        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Notify subscribers, then drain the proxy worker under the shutdown timeout
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        match timeout(self.shutdown_timeout, self.perform_shutdown()).await {
            Ok(Ok(())) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Error during graceful shutdown: {}", e);
                Err(e)
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?}",
                    self.shutdown_timeout
                );
                Err(ProxyError::TimeoutError(
                    "Graceful shutdown timeout".to_string(),
                ))
            }
        }
    }

    /// Wait for the proxy worker to exit, aborting it once the shutdown timeout elapses.
    /// Returns false when the worker had to be aborted.
    pub async fn join_worker(&self, mut worker: JoinHandle<()>) -> bool {
        match timeout(self.shutdown_timeout, &mut worker).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Proxy worker ended abnormally: {}", e);
                true
            }
            Err(_) => {
                warn!(
                    "Proxy worker did not stop within {:?}, aborting",
                    self.shutdown_timeout
                );
                worker.abort();
                false
            }
        }
    }

    async fn perform_shutdown(&self) -> Result<()> {
        if let Some(handle) = &self.proxy_handle {
            info!("Draining proxy task queue");
            handle.shutdown().await?;
        }
        info!("Shutdown operations completed");
        Ok(())
    }
}

/// Shutdown signal wrapper for components
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

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for the shutdown broadcast; a closed or lagged channel counts as shutdown
    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
    }
}
