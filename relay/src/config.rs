//! Relay server configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level relay configuration, loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// Address to bind the public listener on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_addr")]
    pub addr: String,
}

/// TLS certificate settings for the public listener.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

/// Shared secret for agent authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub shared_secret: String,
}

/// Tunnel behaviour knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Reserved path for the agent upgrade endpoint.
    #[serde(default = "default_tunnel_path")]
    pub path: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_tunnel_path() -> String {
    "/_tunnel/ws".to_string()
}

fn default_ping_interval() -> u64 {
    15
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            path: default_tunnel_path(),
            ping_interval_secs: default_ping_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

impl TunnelConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl TlsConfig {
    /// The certificate pair, required once TLS is enabled.
    pub fn cert_paths(&self) -> Result<(&str, &str)> {
        match (self.cert_file.as_deref(), self.key_file.as_deref()) {
            (Some(cert), Some(key)) => Ok((cert, key)),
            _ => bail!("tls.cert_file and tls.key_file are required when tls.enabled"),
        }
    }
}

impl RelayConfig {
    /// Read and parse a relay configuration file.
    pub fn load(path: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        let config: RelayConfig = serde_yaml::from_str(&data).context("parsing config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.shared_secret.is_empty() {
            bail!("auth.shared_secret is required");
        }
        if self.tls.enabled {
            self.tls.cert_paths()?;
        }
        Ok(())
    }
}
