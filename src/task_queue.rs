//! Task Queue Module
//!
//! The proxy is owned by a single worker task. Callers go through a cloneable
//! `ProxyHandle` that enqueues work on an unbounded FIFO channel and awaits a
//! oneshot reply, so reads and invalidations are applied one at a time in
//! submission order.

use crate::cache_types::{ItemRecord, Version};
use crate::consistent_cache::ConsistentCacheStats;
use crate::metrics::ProxyMetrics;
use crate::proxy::MccProxy;
use crate::{ProxyError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Task {
    Read {
        keys: Vec<String>,
        reply: oneshot::Sender<Result<Vec<ItemRecord>>>,
    },
    Invalidate {
        keys: Vec<String>,
        version: Version,
        reply: oneshot::Sender<Result<bool>>,
    },
    Stats {
        reply: oneshot::Sender<ConsistentCacheStats>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

impl Task {
    /// Answer a task that will never run
    fn reject(self) {
        let unavailable = || ProxyError::ServiceUnavailable("Proxy is shutting down".to_string());
        match self {
            Task::Read { reply, .. } => {
                let _ = reply.send(Err(unavailable()));
            }
            Task::Invalidate { reply, .. } => {
                let _ = reply.send(Err(unavailable()));
            }
            Task::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
            // Dropping the sender is reported as unavailable on the caller side
            Task::Stats { .. } => {}
        }
    }
}

/// Cloneable front door to the proxy worker
#[derive(Clone)]
pub struct ProxyHandle {
    sender: mpsc::UnboundedSender<Task>,
    metrics: Arc<ProxyMetrics>,
}

/// Move `proxy` into a new worker task and return its handle
pub fn spawn_worker(proxy: MccProxy) -> (ProxyHandle, JoinHandle<()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let metrics = proxy.metrics();
    let worker = tokio::spawn(run_worker(proxy, receiver));
    (ProxyHandle { sender, metrics }, worker)
}

async fn run_worker(mut proxy: MccProxy, mut receiver: mpsc::UnboundedReceiver<Task>) {
    info!("Proxy worker started");
    let metrics = proxy.metrics();

    while let Some(task) = receiver.recv().await {
        match task {
            Task::Read { keys, reply } => {
                let result = proxy.process_read(&keys).await;
                if let Err(e) = &result {
                    warn!("Read of {} keys failed: {}", keys.len(), e);
                    metrics.record_failed_task();
                }
                let _ = reply.send(result);
            }
            Task::Invalidate {
                keys,
                version,
                reply,
            } => {
                let result = proxy.process_invalidation(&keys, version).await;
                if let Err(e) = &result {
                    warn!("Invalidation of {} keys failed: {}", keys.len(), e);
                    metrics.record_failed_task();
                }
                let _ = reply.send(result);
            }
            Task::Stats { reply } => {
                let _ = reply.send(proxy.cache_stats());
            }
            Task::Shutdown { reply } => {
                receiver.close();
                let mut rejected = 0;
                while let Ok(task) = receiver.try_recv() {
                    task.reject();
                    rejected += 1;
                }
                if rejected > 0 {
                    info!("Rejected {} tasks queued behind shutdown", rejected);
                }
                let _ = reply.send(proxy.stop().await);
                info!("Proxy worker stopped");
                return;
            }
        }
    }

    // Every handle was dropped without an explicit shutdown
    if let Err(e) = proxy.stop().await {
        warn!("Failed to stop proxy: {}", e);
    }
    info!("Proxy worker stopped");
}

impl ProxyHandle {
    pub async fn read(&self, keys: Vec<String>) -> Result<Vec<ItemRecord>> {
        let (reply, response) = oneshot::channel();
        self.submit(Task::Read { keys, reply })?;
        await_reply(response).await?
    }

    pub async fn invalidate(&self, keys: Vec<String>, version: Version) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.submit(Task::Invalidate {
            keys,
            version,
            reply,
        })?;
        await_reply(response).await?
    }

    /// Index statistics as seen by the worker after every earlier task
    pub async fn cache_stats(&self) -> Result<ConsistentCacheStats> {
        let (reply, response) = oneshot::channel();
        self.submit(Task::Stats { reply })?;
        await_reply(response).await
    }

    /// Counters are read directly, without queueing
    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        self.metrics.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Let every task already queued finish, reject later ones and disconnect the
    /// collaborators. Calling it again after the worker stopped is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        if self.sender.send(Task::Shutdown { reply }).is_err() {
            debug!("Proxy worker already stopped");
            return Ok(());
        }
        await_reply(response).await?
    }

    fn submit(&self, task: Task) -> Result<()> {
        self.sender
            .send(task)
            .map_err(|_| ProxyError::ServiceUnavailable("Proxy worker is not running".to_string()))
    }
}

async fn await_reply<T>(response: oneshot::Receiver<T>) -> Result<T> {
    response
        .await
        .map_err(|_| ProxyError::ServiceUnavailable("Proxy worker dropped the request".to_string()))
}
