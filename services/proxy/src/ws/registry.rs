//! Tracks live upstream connections and prunes the ones that stop answering.

use async_trait::async_trait;
use futures::future::join_all;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A handle to one live upstream socket.
#[async_trait]
pub trait UpstreamLink: Send + Sync {
    /// Lightweight liveness check.
    async fn probe(&self) -> anyhow::Result<()>;
    /// Closes the socket. Safe to call more than once.
    async fn close(&self);
}

/// The set of live upstream links, shared by every session and the health monitor.
#[derive(Default)]
pub struct ConnectionRegistry {
    links: Mutex<HashMap<Uuid, Arc<dyn UpstreamLink>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: Uuid, link: Arc<dyn UpstreamLink>) {
        let mut links = self.links.lock().await;
        links.insert(id, link);
        debug!(connection_id = %id, active = links.len(), "Registered upstream connection.");
    }

    /// Removes a link without closing it. Returns `None` if it was already gone.
    pub async fn remove(&self, id: Uuid) -> Option<Arc<dyn UpstreamLink>> {
        self.links.lock().await.remove(&id)
    }

    /// Removes and closes a link. Returns whether this call removed it.
    pub async fn remove_and_close(&self, id: Uuid) -> bool {
        match self.remove(id).await {
            Some(link) => {
                link.close().await;
                debug!(connection_id = %id, "Removed and closed upstream connection.");
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.links.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.links.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<(Uuid, Arc<dyn UpstreamLink>)> {
        self.links
            .lock()
            .await
            .iter()
            .map(|(id, link)| (*id, link.clone()))
            .collect()
    }

    /// Empties the registry and closes every link it held.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.links.lock().await.drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "Closing remaining upstream connections.");
        }
        join_all(drained.into_iter().map(|(_, link)| async move { link.close().await })).await;
    }

    /// Probes every registered link once, removing and closing the failures.
    ///
    /// Returns the ids that were pruned by this call.
    pub async fn probe_all(&self, probe_timeout: Duration) -> Vec<Uuid> {
        let probes = self.snapshot().await.into_iter().map(|(id, link)| async move {
            let healthy = match tokio::time::timeout(probe_timeout, link.probe()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(connection_id = %id, error = %e, "Upstream liveness probe failed.");
                    false
                }
                Err(_) => {
                    warn!(connection_id = %id, "Upstream liveness probe timed out.");
                    false
                }
            };
            (id, healthy)
        });

        let mut pruned = Vec::new();
        for (id, healthy) in join_all(probes).await {
            if !healthy && self.remove_and_close(id).await {
                info!(connection_id = %id, "Found stale connection, removed.");
                pruned.push(id);
            }
        }
        pruned
    }
}

/// Probes all registered links every `interval` until `cancel` fires.
///
/// On cancellation every remaining link is closed and the registry cleared.
pub async fn run_health_monitor(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    probe_timeout: Duration,
    cancel: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "Health monitor started.");
    loop {
        let active = registry.len().await;
        info!(active, "Active upstream connections.");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = registry.probe_all(probe_timeout) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    registry.close_all().await;
    info!("Health monitor stopped.");
}
