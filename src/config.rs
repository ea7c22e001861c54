//! Application configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Proxy listener settings
    pub proxy: ProxyConfig,

    /// Inspection UI settings
    pub ui: UiConfig,

    /// Capture and persistence settings
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy listen address
    pub listen_addr: String,

    /// Intercept HTTPS via the local root CA. When disabled, CONNECT
    /// tunnels are spliced opaquely and produce no records.
    pub mitm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// Inspection UI listen address
    pub listen_addr: String,

    /// Deadline for replayed requests, in seconds
    pub replay_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Directory holding the CA files and the transcript database
    pub data_dir: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            mitm: true,
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8081".to_string(),
            replay_timeout_secs: 30,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, or defaults when no path is
    /// given.
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {path}"))?;
                toml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {path}"))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.proxy
            .listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid proxy listen address {:?}", self.proxy.listen_addr))?;
        self.ui
            .listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid ui listen address {:?}", self.ui.listen_addr))?;
        if self.proxy.listen_addr == self.ui.listen_addr {
            anyhow::bail!("proxy and ui listen addresses must differ");
        }
        if self.ui.replay_timeout_secs == 0 {
            anyhow::bail!("replay timeout must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.proxy.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.ui.listen_addr, "127.0.0.1:8081");
        assert!(config.proxy.mitm);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            listen_addr = "0.0.0.0:3128"
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.listen_addr, "0.0.0.0:3128");
        assert!(config.proxy.mitm);
        assert_eq!(config.ui.listen_addr, "127.0.0.1:8081");
    }

    #[test]
    fn colliding_addresses_are_rejected() {
        let mut config = Config::default();
        config.ui.listen_addr = config.proxy.listen_addr.clone();
        assert!(config.validate().is_err());
    }
}
