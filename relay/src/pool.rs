//! Agent pool with round-robin selection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::tunnel::Tunnel;

#[derive(Debug, Error)]
#[error("no agents connected")]
pub struct NoAgents;

/// The set of live agent tunnels. A tunnel is a member iff it has not
/// signalled done; a watcher task evicts it the moment it closes.
pub struct Pool {
    tunnels: RwLock<Vec<Arc<Tunnel>>>,
    counter: AtomicU64,
}

impl Pool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tunnels: RwLock::new(Vec::new()),
            counter: AtomicU64::new(0),
        })
    }

    /// Register a tunnel and watch it for closure.
    pub async fn add(self: &Arc<Self>, tunnel: Arc<Tunnel>) {
        {
            self.tunnels.write().await.push(tunnel.clone());
        }
        let pool_size = self.size().await;
        info!(id = %tunnel.id(), pool_size, "agent added to pool");

        let pool = self.clone();
        tokio::spawn(async move {
            tunnel.closed().await;
            pool.remove(&tunnel).await;
        });
    }

    /// Unlink a tunnel. Idempotent.
    pub async fn remove(&self, tunnel: &Arc<Tunnel>) {
        let mut tunnels = self.tunnels.write().await;
        if let Some(pos) = tunnels.iter().position(|t| Arc::ptr_eq(t, tunnel)) {
            tunnels.remove(pos);
            info!(id = %tunnel.id(), pool_size = tunnels.len(), "agent removed from pool");
        }
    }

    /// Next tunnel by round-robin.
    pub async fn get(&self) -> Result<Arc<Tunnel>, NoAgents> {
        let tunnels = self.tunnels.read().await;
        if tunnels.is_empty() {
            return Err(NoAgents);
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) as usize % tunnels.len();
        Ok(tunnels[idx].clone())
    }

    pub async fn size(&self) -> usize {
        self.tunnels.read().await.len()
    }
}
