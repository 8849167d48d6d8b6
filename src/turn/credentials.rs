//! TURN REST style credentials.
//!
//! `username = "<expiry>:<nonce>"`, `credential = base64(HMAC-SHA1(secret, username))`.
//! The minter and the authenticator share one [`SharedSecret`] and one
//! [`derive_credential`] so the relay always recomputes what was issued.

use crate::turn::config::{RelayConfig, MIN_TTL_SEC};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use sha1::Sha1;
use std::fmt;
use std::sync::Arc;

type HmacSha1 = Hmac<Sha1>;

/// Nonce length in bytes (hex encoded in the username).
const NONCE_LEN: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("relay shared secret is not configured")]
    SecretUnset,
    #[error("credential expiry out of range (ttl {0}s)")]
    ExpiryOutOfRange(i64),
}

/// Read-only shared secret. Cloning shares the same bytes.
#[derive(Clone)]
pub struct SharedSecret(Arc<[u8]>);

impl SharedSecret {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self(Arc::from(secret.as_ref()))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// The one derivation used by both sides.
pub fn derive_credential(secret: &SharedSecret, username: &str) -> String {
    let mut mac = match HmacSha1::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(username.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Expiry (unix seconds) encoded in a username, if it has one.
pub fn username_expiry(username: &str) -> Option<i64> {
    let (expiry, nonce) = username.split_once(':')?;
    if nonce.is_empty() {
        return None;
    }
    expiry.parse().ok()
}

/// Issued credential, serialized as the `/turn-creds` response body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub credential: String,
    #[serde(rename = "ttlSec")]
    pub ttl_seconds: i64,
    pub servers: Vec<String>,
    pub realm: String,
}

#[derive(Debug, Clone)]
pub struct CredentialMinter {
    secret: Option<SharedSecret>,
    realm: String,
    default_ttl: i64,
    max_ttl: i64,
    servers: Vec<String>,
}

impl CredentialMinter {
    pub fn new(
        secret: Option<SharedSecret>,
        realm: impl Into<String>,
        default_ttl: i64,
        max_ttl: i64,
        servers: Vec<String>,
    ) -> Self {
        Self {
            secret,
            realm: realm.into(),
            default_ttl,
            max_ttl: max_ttl.max(MIN_TTL_SEC),
            servers,
        }
    }

    /// Build from the `[relay]` section. `servers` overrides the static list
    /// when the configuration leaves it empty (embedded relay addresses).
    pub fn from_config(config: &RelayConfig, derived_servers: Vec<String>) -> Self {
        let servers = if config.servers.is_empty() {
            derived_servers
        } else {
            config.servers.clone()
        };
        Self::new(
            config.secret.as_deref().map(SharedSecret::new),
            config.realm.clone(),
            config.default_ttl_sec,
            config.max_ttl_sec,
            servers,
        )
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// An authenticator bound to the same secret, if one is configured.
    pub fn authenticator(&self) -> Option<RelayAuthenticator> {
        self.secret.clone().map(RelayAuthenticator::new)
    }

    /// Effective lifetime for a requested ttl. Absent, zero and negative
    /// requests get the default; everything lands in `[MIN_TTL_SEC, max]`.
    pub fn clamp_ttl(&self, requested: Option<i64>) -> i64 {
        let ttl = match requested {
            Some(ttl) if ttl > 0 => ttl,
            _ => self.default_ttl,
        };
        ttl.clamp(MIN_TTL_SEC, self.max_ttl)
    }

    pub fn mint(
        &self,
        ttl_request: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Credential, CredentialError> {
        let secret = self.secret.as_ref().ok_or(CredentialError::SecretUnset)?;

        let ttl = self.clamp_ttl(ttl_request);
        let expiry = now
            .timestamp()
            .checked_add(ttl)
            .ok_or(CredentialError::ExpiryOutOfRange(ttl))?;
        let username = format!("{}:{}", expiry, generate_nonce());
        let credential = derive_credential(secret, &username);

        Ok(Credential {
            username,
            credential,
            ttl_seconds: ttl,
            servers: self.servers.clone(),
            realm: self.realm.clone(),
        })
    }
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Recomputes credentials for the relay. Expiry is left to the caller.
#[derive(Debug, Clone)]
pub struct RelayAuthenticator {
    secret: SharedSecret,
}

impl RelayAuthenticator {
    pub fn new(secret: SharedSecret) -> Self {
        Self { secret }
    }

    /// Returns the derived credential and `ok`, which is always `true`:
    /// the relay decides by comparing what it received.
    pub fn authenticate(&self, username: &str, _realm: &str) -> (String, bool) {
        (derive_credential(&self.secret, username), true)
    }
}
