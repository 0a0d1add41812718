use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path, time::Duration};
use thiserror::Error;

use crate::frame::DEFAULT_MAX_FRAME_SIZE;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

const fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

const fn default_handshake_timeout_secs() -> u64 {
    10
}

const fn default_shutdown_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub ip_address: String,
    pub port: u16,
    /// Virtual hostname, as sent in the handshake, to backend server.
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

/// Where traffic for one virtual host is relayed to. Never mutated once
/// loaded; a reload builds new values.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ip_address must not be empty")]
    EmptyIpAddress,
    #[error("port must be greater than 0")]
    ZeroPort,
    #[error("max_frame_size must be greater than 0")]
    ZeroMaxFrameSize,
}

impl ProxyConfig {
    #[must_use]
    pub fn new(ip_address: impl Into<String>, port: u16) -> Self {
        Self {
            ip_address: ip_address.into(),
            port,
            servers: HashMap::new(),
            max_frame_size: default_max_frame_size(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }

    #[must_use]
    pub fn with_server(
        mut self,
        hostname: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        self.servers.insert(
            hostname.into(),
            ServerConfig {
                host: host.into(),
                port,
            },
        );
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ip_address.trim().is_empty() {
            return Err(ConfigError::EmptyIpAddress);
        }
        if self.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::ZeroMaxFrameSize);
        }
        Ok(())
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Parses and validates a TOML configuration document.
pub fn parse_config(content: &str) -> Result<ProxyConfig> {
    let config: ProxyConfig =
        toml::from_str(content).context("Failed to parse configuration as valid TOML")?;
    config.validate().context("Invalid proxy configuration")?;
    Ok(config)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<ProxyConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Failed to load {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
        ip_address = "0.0.0.0"
        port = 25565
        max_frame_size = 65536
        handshake_timeout_secs = 3
        shutdown_timeout_secs = 5

        [servers."survival.example.com"]
        host = "10.0.0.1"
        port = 25570

        [servers."creative.example.com"]
        host = "10.0.0.2"
        port = 25571
    "#;

    #[test]
    fn parses_full_config() {
        let config = parse_config(FULL_CONFIG).unwrap();

        assert_eq!(config.listen_addr(), "0.0.0.0:25565");
        assert_eq!(config.max_frame_size, 65536);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(3));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.servers.len(), 2);
        assert_eq!(
            config.servers["survival.example.com"],
            ServerConfig {
                host: "10.0.0.1".to_string(),
                port: 25570
            }
        );
    }

    #[test]
    fn fills_in_defaults() {
        let config = parse_config(
            r#"
            ip_address = "127.0.0.1"
            port = 25565
            [servers]
            "#,
        )
        .unwrap();

        assert!(config.servers.is_empty());
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.handshake_timeout_secs, 10);
        assert_eq!(config.shutdown_timeout_secs, 30);
    }

    #[test]
    fn requires_servers_table() {
        assert!(parse_config("ip_address = \"127.0.0.1\"\nport = 25565\n").is_err());
    }

    #[test]
    fn rejects_blank_ip_address() {
        let config = ProxyConfig::new("  ", 25565);
        assert_eq!(config.validate(), Err(ConfigError::EmptyIpAddress));
    }

    #[test]
    fn rejects_zero_port() {
        let err = parse_config("ip_address = \"127.0.0.1\"\nport = 0\n[servers]\n").unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::ZeroPort)
        );
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(parse_config("ip_address = \"127.0.0.1\"\nport = 70000\n[servers]\n").is_err());
    }

    #[test]
    fn builder_adds_servers() {
        let config = ProxyConfig::new("127.0.0.1", 25565).with_server("a.test", "10.0.0.1", 1000);
        assert!(config.validate().is_ok());
        assert_eq!(config.servers["a.test"].port, 1000);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load_config("/nonexistent/minecraft-host-proxy.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
