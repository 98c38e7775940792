//! Proxy routing verification.
//!
//! The only reliable way to know traffic leaves through the proxy is to
//! look at the public address the outside world sees: fetch it once
//! directly and once through the proxy, and require them to differ.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::proxy::ProxyDialer;

/// Public ip echo service used for routing checks.
const IP_CHECK_URL: &str = "https://api.ipify.org";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("proxy not routing traffic: direct ip {0} matches proxied ip")]
    NotRouting(IpAddr),
    #[error("invalid ip address returned: {0:?}")]
    InvalidIp(String),
    #[error("fetching public ip: {0}")]
    Http(#[from] reqwest::Error),
}

/// Checks that proxy routing is working.
pub struct Verifier {
    direct: Client,
    proxied: Client,
    check_url: String,
}

impl Verifier {
    pub fn new(dialer: &ProxyDialer, timeout: Duration) -> Result<Self, VerifyError> {
        let direct = Client::builder().timeout(timeout).build()?;
        let proxied = Client::builder()
            .timeout(timeout)
            .proxy(reqwest::Proxy::all(dialer.url().as_str())?)
            .build()?;
        Ok(Self {
            direct,
            proxied,
            check_url: IP_CHECK_URL.to_string(),
        })
    }

    /// Point the verifier at a different ip echo service.
    pub fn with_check_url(mut self, url: &str) -> Self {
        self.check_url = url.to_string();
        self
    }

    /// Confirm traffic routes through the proxy by comparing the direct
    /// public ip with the proxied public ip.
    pub async fn verify_routing(&self) -> Result<(), VerifyError> {
        let direct_ip = fetch_ip(&self.direct, &self.check_url).await?;
        let proxied_ip = fetch_ip(&self.proxied, &self.check_url).await?;

        info!(%direct_ip, %proxied_ip, "proxy routing check");
        if direct_ip == proxied_ip {
            return Err(VerifyError::NotRouting(direct_ip));
        }
        info!("proxy routing verified");
        Ok(())
    }

    /// One proxied fetch; succeeds iff the proxy is still usable.
    pub async fn check_health(&self) -> Result<(), VerifyError> {
        fetch_ip(&self.proxied, &self.check_url).await?;
        Ok(())
    }
}

async fn fetch_ip(client: &Client, url: &str) -> Result<IpAddr, VerifyError> {
    let body = client.get(url).send().await?.text().await?;
    let trimmed = body.trim();
    trimmed
        .parse()
        .map_err(|_| VerifyError::InvalidIp(trimmed.to_string()))
}

/// Run health checks at `interval`. The first failure is posted to the
/// returned channel and the task exits; abort the handle to stop it.
pub fn start_periodic_check(
    verifier: Verifier,
    interval: Duration,
) -> (JoinHandle<()>, mpsc::Receiver<VerifyError>) {
    let (tx, rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the zeroth tick fires immediately
        loop {
            ticker.tick().await;
            match verifier.check_health().await {
                Ok(()) => debug!("periodic proxy check passed"),
                Err(err) => {
                    error!(%err, "periodic proxy check failed");
                    let _ = tx.try_send(err);
                    return;
                }
            }
        }
    });
    (handle, rx)
}
