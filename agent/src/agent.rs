//! Agent lifecycle: proxy verification, connection supervision, reconnect.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::proxy::ProxyDialer;
use crate::tunnel::Tunnel;
use crate::verify::{start_periodic_check, Verifier};

/// Maintains one live tunnel to the relay for the life of the process.
pub struct Agent {
    cfg: AgentConfig,
    dialer: Option<ProxyDialer>,
}

impl Agent {
    pub fn new(cfg: AgentConfig) -> Result<Self> {
        let dialer = match &cfg.proxy.url {
            Some(url) => Some(
                ProxyDialer::new(url, cfg.proxy.health_timeout())
                    .context("building proxy dialer")?,
            ),
            None => None,
        };
        Ok(Self { cfg, dialer })
    }

    /// Run until `shutdown` fires. When a proxy is configured with
    /// `verify_routing`, a failed pre-flight check refuses to start.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if let Some(dialer) = &self.dialer {
            if self.cfg.proxy.verify_routing {
                info!("verifying proxy routing before connecting");
                Verifier::new(dialer, self.cfg.proxy.health_timeout())?
                    .verify_routing()
                    .await
                    .context("proxy routing verification failed")?;
            }
        }
        self.reconnect_loop(shutdown).await
    }

    async fn reconnect_loop(&self, shutdown: CancellationToken) -> Result<()> {
        let initial = self.cfg.tunnel.reconnect_delay();
        let max = self.cfg.tunnel.max_reconnect_delay();
        let mut delay = initial;

        loop {
            match Tunnel::connect(&self.cfg, self.dialer.as_ref()).await {
                Ok(tunnel) => {
                    // a connection landed, start the next failure from scratch
                    delay = initial;
                    if let Err(err) = self.supervise(&tunnel, &shutdown).await {
                        warn!(%err, "tunnel terminated");
                    }
                    tunnel.close().await;
                }
                Err(err) => warn!(%err, "failed to reach relay"),
            }

            if shutdown.is_cancelled() {
                return Ok(());
            }

            warn!(?delay, "tunnel disconnected, reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
            delay = (delay * 2).min(max);
        }
    }

    /// Race tunnel exit, periodic health failure, and shutdown; the first
    /// event wins and the tunnel comes down.
    async fn supervise(&self, tunnel: &Arc<Tunnel>, shutdown: &CancellationToken) -> Result<()> {
        let checker = match (&self.dialer, self.cfg.proxy.recheck_interval()) {
            (Some(dialer), Some(interval)) => {
                let verifier = Verifier::new(dialer, self.cfg.proxy.health_timeout())?;
                Some(start_periodic_check(verifier, interval))
            }
            _ => None,
        };
        let (check_handle, mut check_rx) = match checker {
            Some((handle, rx)) => (Some(handle), Some(rx)),
            None => (None, None),
        };

        let health_failed = async {
            match check_rx.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            result = tunnel.run() => result,
            failure = health_failed => {
                let err = failure
                    .map(anyhow::Error::from)
                    .unwrap_or_else(|| anyhow::anyhow!("proxy health checker stopped"));
                error!(%err, "proxy health check failed, closing tunnel");
                Err(err)
            }
            _ = shutdown.cancelled() => Ok(()),
        };

        if let Some(handle) = check_handle {
            handle.abort();
        }
        tunnel.close().await;
        result
    }
}
