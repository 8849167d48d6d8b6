use serde::{Deserialize, Serialize};
use std::env;
use std::net::IpAddr;

use crate::config::ConfigError;

/// Lower bound for any issued credential lifetime.
pub const MIN_TTL_SEC: i64 = 60;

/// Upper bound for `max_ttl_sec` (ten years).
pub const MAX_TTL_LIMIT_SEC: i64 = 10 * 365 * 24 * 3600;

fn default_realm() -> String {
    "speedtest".to_string()
}

fn default_ttl() -> i64 {
    3600
}

fn default_max_ttl() -> i64 {
    86400
}

fn default_port() -> u16 {
    3478
}

/// `[relay]` section: shared secret, credential lifetimes and the embedded
/// TURN listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Shared secret for the TURN REST credential scheme. Never transmitted.
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default = "default_ttl")]
    pub default_ttl_sec: i64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl_sec: i64,
    /// Static relay URIs handed to clients. Empty means "derive from the
    /// embedded relay".
    #[serde(default)]
    pub servers: Vec<String>,
    /// Run the embedded TURN server.
    #[serde(default)]
    pub embedded: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address advertised for relayed candidates and in derived URIs.
    #[serde(default)]
    pub public_ip: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            secret: None,
            realm: default_realm(),
            default_ttl_sec: default_ttl(),
            max_ttl_sec: default_max_ttl(),
            servers: Vec::new(),
            embedded: false,
            port: default_port(),
            public_ip: None,
        }
    }
}

impl RelayConfig {
    /// Overlay `TURN_*` environment variables on top of `self`.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(secret) = env::var("TURN_SECRET") {
            self.secret = Some(secret);
        }
        if let Ok(realm) = env::var("TURN_REALM") {
            self.realm = realm;
        }
        if let Ok(servers) = env::var("TURN_SERVERS") {
            self.servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(raw) = env::var("TURN_DEFAULT_TTL_SEC") {
            self.default_ttl_sec = parse_env("TURN_DEFAULT_TTL_SEC", &raw)?;
        }
        if let Ok(raw) = env::var("TURN_MAX_TTL_SEC") {
            self.max_ttl_sec = parse_env("TURN_MAX_TTL_SEC", &raw)?;
        }
        if let Ok(raw) = env::var("TURN_PORT") {
            self.port = parse_env("TURN_PORT", &raw)?;
        }
        if let Ok(ip) = env::var("TURN_PUBLIC_IP") {
            self.public_ip = Some(ip);
        }
        if let Ok(raw) = env::var("TURN_EMBEDDED") {
            self.embedded = parse_env("TURN_EMBEDDED", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_ttl_sec < MIN_TTL_SEC {
            return Err(ConfigError::Invalid(format!(
                "relay.max_ttl_sec: {} (must be >= {})",
                self.max_ttl_sec, MIN_TTL_SEC
            )));
        }

        if self.max_ttl_sec > MAX_TTL_LIMIT_SEC {
            return Err(ConfigError::Invalid(format!(
                "relay.max_ttl_sec: {} (must be <= {})",
                self.max_ttl_sec, MAX_TTL_LIMIT_SEC
            )));
        }

        if self.default_ttl_sec > self.max_ttl_sec {
            return Err(ConfigError::Invalid(format!(
                "relay.default_ttl_sec: {} (must be <= max_ttl_sec {})",
                self.default_ttl_sec, self.max_ttl_sec
            )));
        }

        if matches!(self.secret.as_deref(), Some("")) {
            return Err(ConfigError::Invalid(
                "relay.secret must not be empty when set".to_string(),
            ));
        }

        if self.embedded && self.secret.is_none() {
            return Err(ConfigError::Invalid(
                "relay.embedded requires relay.secret (TURN_SECRET)".to_string(),
            ));
        }

        if let Some(ip) = &self.public_ip {
            ip.parse::<IpAddr>().map_err(|e| {
                ConfigError::Invalid(format!("relay.public_ip: {} ({})", ip, e))
            })?;
        }

        for server in &self.servers {
            if !(server.starts_with("turn:")
                || server.starts_with("turns:")
                || server.starts_with("stun:"))
            {
                return Err(ConfigError::Invalid(format!(
                    "relay.servers: unsupported URI scheme in {}",
                    server
                )));
            }
        }

        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }
}

pub(crate) fn parse_env<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{}={} ({})", name, raw, e)))
}
