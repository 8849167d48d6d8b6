//! Server configuration: TOML file, then `TURN_*`/`SPEEDTEST_*` environment,
//! then CLI overrides (applied by the binary).

use crate::turn::config::{parse_env, RelayConfig};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_session_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_gather_timeout() -> u64 {
    10
}

fn default_max_sessions() -> usize {
    1000
}

/// `[probe]` section: signaling and loss-probe sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Whether the peer-transport capability is offered at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// STUN servers used by the server side of each peer connection.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_sec: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_sec: u64,
    #[serde(default = "default_gather_timeout")]
    pub gather_timeout_sec: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default)]
    pub udp_port_min: Option<u16>,
    #[serde(default)]
    pub udp_port_max: Option<u16>,
    /// Public IP substituted into host candidates (1:1 NAT).
    #[serde(default)]
    pub nat_1to1_ip: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ice_servers: default_ice_servers(),
            session_timeout_sec: default_session_timeout(),
            sweep_interval_sec: default_sweep_interval(),
            gather_timeout_sec: default_gather_timeout(),
            max_sessions: default_max_sessions(),
            udp_port_min: None,
            udp_port_max: None,
            nat_1to1_ip: None,
        }
    }
}

impl ProbeConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_sec)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_sec)
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_secs(self.gather_timeout_sec)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout_sec == 0 {
            return Err(ConfigError::Invalid(
                "probe.session_timeout_sec must be > 0".to_string(),
            ));
        }
        if self.sweep_interval_sec == 0 {
            return Err(ConfigError::Invalid(
                "probe.sweep_interval_sec must be > 0".to_string(),
            ));
        }
        if !(1..=60).contains(&self.gather_timeout_sec) {
            return Err(ConfigError::Invalid(format!(
                "probe.gather_timeout_sec: {} (must be between 1 and 60)",
                self.gather_timeout_sec
            )));
        }
        if self.session_timeout_sec <= self.gather_timeout_sec {
            return Err(ConfigError::Invalid(format!(
                "probe.session_timeout_sec: {} (must exceed gather_timeout_sec {})",
                self.session_timeout_sec, self.gather_timeout_sec
            )));
        }
        if self.max_sessions == 0 || self.max_sessions > 10_000 {
            return Err(ConfigError::Invalid(format!(
                "probe.max_sessions: {} (must be between 1 and 10000)",
                self.max_sessions
            )));
        }
        match (self.udp_port_min, self.udp_port_max) {
            (Some(min), Some(max)) if min > max => {
                return Err(ConfigError::Invalid(format!(
                    "probe.udp_port_min {} > udp_port_max {}",
                    min, max
                )));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "probe.udp_port_min and udp_port_max must be set together".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            relay: RelayConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load the TOML file if present, then apply environment overrides.
    /// A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml(&content)?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(listen) = env::var("SPEEDTEST_LISTEN") {
            self.listen = listen;
        }
        if let Ok(raw) = env::var("SPEEDTEST_SESSION_TIMEOUT_SEC") {
            self.probe.session_timeout_sec = parse_env("SPEEDTEST_SESSION_TIMEOUT_SEC", &raw)?;
        }
        if let Ok(raw) = env::var("SPEEDTEST_ICE_SERVERS") {
            self.probe.ice_servers = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        self.relay.apply_env()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        self.relay.validate()?;
        self.probe.validate()
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("listen: {} ({})", self.listen, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probe.session_timeout(), Duration::from_secs(30));
        assert_eq!(config.probe.sweep_interval(), Duration::from_secs(10));
        assert_eq!(config.probe.gather_timeout(), Duration::from_secs(10));
        assert!(!config.relay.is_enabled());
    }

    #[test]
    fn test_from_toml_partial_sections() {
        let config = ServerConfig::from_toml(
            r#"
            listen = "127.0.0.1:9000"

            [relay]
            secret = "s3cret"
            max_ttl_sec = 7200

            [probe]
            session_timeout_sec = 45
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr().unwrap().port(), 9000);
        assert_eq!(config.relay.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.relay.max_ttl_sec, 7200);
        assert_eq!(config.relay.default_ttl_sec, 3600);
        assert_eq!(config.probe.session_timeout_sec, 45);
        assert_eq!(config.probe.sweep_interval_sec, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_probe_validation() {
        let mut probe = ProbeConfig::default();
        probe.gather_timeout_sec = 0;
        assert!(probe.validate().is_err());
        probe.gather_timeout_sec = 10;

        probe.session_timeout_sec = 10;
        assert!(probe.validate().is_err());
        probe.session_timeout_sec = 5;
        assert!(probe.validate().is_err());
        probe.session_timeout_sec = 11;
        assert!(probe.validate().is_ok());
        probe.session_timeout_sec = 30;

        probe.max_sessions = 0;
        assert!(probe.validate().is_err());
        probe.max_sessions = 10;

        probe.udp_port_min = Some(50000);
        assert!(probe.validate().is_err());
        probe.udp_port_max = Some(40000);
        assert!(probe.validate().is_err());
        probe.udp_port_max = Some(60000);
        assert!(probe.validate().is_ok());
    }

    #[test]
    fn test_invalid_listen_rejected() {
        let config = ServerConfig {
            listen: "nowhere".to_string(),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_not_serialized() {
        let mut config = ServerConfig::default();
        config.relay.secret = Some("hidden".to_string());
        let rendered = toml::to_string(&config).unwrap();
        assert!(!rendered.contains("hidden"));
    }
}
