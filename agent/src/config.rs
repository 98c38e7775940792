//! Agent configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level agent configuration, loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub relay: RelayEndpoint,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// The relay's WebSocket endpoint (`ws://` or `wss://`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayEndpoint {
    #[serde(default)]
    pub url: String,
}

/// Egress proxy settings. No `url` means the agent dials directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_verify_routing")]
    pub verify_routing: bool,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    /// Zero disables the periodic routing check.
    #[serde(default = "default_recheck_interval")]
    pub recheck_interval_secs: u64,
}

/// The local backend the agent proxies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_target_url")]
    pub target_url: String,
}

/// Shared secret for relay authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub shared_secret: String,
}

/// Reconnection and keepalive behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_verify_routing() -> bool {
    true
}

fn default_health_timeout() -> u64 {
    10
}

fn default_recheck_interval() -> u64 {
    5 * 60
}

fn default_target_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_reconnect_delay() -> u64 {
    2
}

fn default_max_reconnect_delay() -> u64 {
    60
}

fn default_ping_interval() -> u64 {
    15
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            url: None,
            verify_routing: default_verify_routing(),
            health_timeout_secs: default_health_timeout(),
            recheck_interval_secs: default_recheck_interval(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            target_url: default_target_url(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_delay_secs: default_max_reconnect_delay(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay: RelayEndpoint::default(),
            proxy: ProxyConfig::default(),
            backend: BackendConfig::default(),
            auth: AuthConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn recheck_interval(&self) -> Option<Duration> {
        (self.recheck_interval_secs > 0).then(|| Duration::from_secs(self.recheck_interval_secs))
    }
}

impl TunnelConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl AgentConfig {
    /// Read and parse an agent configuration file.
    pub fn load(path: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        let config: AgentConfig = serde_yaml::from_str(&data).context("parsing config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay.url.is_empty() {
            bail!("relay.url is required");
        }
        if self.auth.shared_secret.is_empty() {
            bail!("auth.shared_secret is required");
        }
        Ok(())
    }
}
