//! Embedded TURN relay.
//!
//! Packet forwarding is done by `webrtc::turn`; this module only wires the
//! [`RelayAuthenticator`] in as its auth handler and works out which
//! addresses to advertise.

use crate::turn::config::RelayConfig;
use crate::turn::credentials::{username_expiry, RelayAuthenticator};
use anyhow::Context;
use chrono::Utc;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use webrtc::turn::auth::{generate_auth_key, AuthHandler};
use webrtc::turn::relay::relay_static::RelayAddressGeneratorStatic;
use webrtc::turn::server::config::{ConnConfig, ServerConfig as TurnServerConfig};
use webrtc::turn::server::Server;
use webrtc::util::vnet::net::Net;

/// Bridges [`RelayAuthenticator`] into the TURN server.
///
/// The authenticator itself never looks at the expiry; this adapter does,
/// and refuses usernames that are expired or carry no expiry at all.
pub struct RelayAuthHandler {
    authenticator: RelayAuthenticator,
}

impl RelayAuthHandler {
    pub fn new(authenticator: RelayAuthenticator) -> Self {
        Self { authenticator }
    }

    fn check_expiry(username: &str, now: i64) -> Result<(), String> {
        match username_expiry(username) {
            Some(expiry) if expiry >= now => Ok(()),
            Some(expiry) => Err(format!("credential expired at {}", expiry)),
            None => Err("username carries no expiry".to_string()),
        }
    }
}

impl AuthHandler for RelayAuthHandler {
    fn auth_handle(
        &self,
        username: &str,
        realm: &str,
        src_addr: SocketAddr,
    ) -> Result<Vec<u8>, webrtc::turn::Error> {
        if let Err(reason) = Self::check_expiry(username, Utc::now().timestamp()) {
            debug!(%src_addr, %reason, "relay auth rejected");
            return Err(webrtc::turn::Error::Other(reason));
        }

        let (credential, ok) = self.authenticator.authenticate(username, realm);
        if !ok {
            return Err(webrtc::turn::Error::Other("authentication refused".to_string()));
        }

        Ok(generate_auth_key(username, realm, &credential))
    }
}

/// Running embedded relay.
pub struct RelayServer {
    server: Server,
    advertised: SocketAddr,
}

impl RelayServer {
    pub async fn start(
        config: &RelayConfig,
        authenticator: RelayAuthenticator,
    ) -> anyhow::Result<Self> {
        let public_ip = advertised_ip(config)?;

        let conn = Arc::new(
            UdpSocket::bind(format!("0.0.0.0:{}", config.port))
                .await
                .with_context(|| format!("failed to bind relay port {}", config.port))?,
        );
        let port = conn.local_addr()?.port();

        let server = Server::new(TurnServerConfig {
            conn_configs: vec![ConnConfig {
                conn,
                relay_addr_generator: Box::new(RelayAddressGeneratorStatic {
                    relay_address: public_ip,
                    address: "0.0.0.0".to_owned(),
                    net: Arc::new(Net::new(None)),
                }),
            }],
            realm: config.realm.clone(),
            auth_handler: Arc::new(RelayAuthHandler::new(authenticator)),
            channel_bind_timeout: Duration::from_secs(0),
            alloc_close_notify: None,
        })
        .await
        .context("failed to start TURN server")?;

        let advertised = SocketAddr::new(public_ip, port);
        info!(%advertised, realm = %config.realm, "🔄 embedded relay started");

        Ok(Self { server, advertised })
    }

    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised
    }

    pub fn urls(&self) -> Vec<String> {
        relay_urls(self.advertised)
    }

    pub async fn close(self) {
        if let Err(e) = self.server.close().await {
            warn!(error = %e, "relay close failed");
        }
        info!("embedded relay stopped");
    }
}

/// URIs handed to clients for a relay reachable at `addr`.
pub fn relay_urls(addr: SocketAddr) -> Vec<String> {
    let host = match addr.ip() {
        IpAddr::V6(ip) => format!("[{}]", ip),
        IpAddr::V4(ip) => ip.to_string(),
    };
    vec![
        format!("turn:{}:{}?transport=udp", host, addr.port()),
        format!("stun:{}:{}", host, addr.port()),
    ]
}

fn advertised_ip(config: &RelayConfig) -> anyhow::Result<IpAddr> {
    if let Some(ip) = &config.public_ip {
        return ip
            .parse()
            .with_context(|| format!("invalid relay.public_ip {}", ip));
    }

    let detected = get_ip_via_udp_probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    warn!(ip = %detected, "relay.public_ip not set, advertising detected address");
    Ok(detected)
}

/// Local IP of the default route.
fn get_ip_via_udp_probe() -> Option<IpAddr> {
    let socket = StdUdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("1.1.1.1:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_loopback() {
        None
    } else {
        Some(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::credentials::{CredentialMinter, SharedSecret};

    #[test]
    fn test_relay_urls_v4_and_v6() {
        let v4 = relay_urls("203.0.113.7:3478".parse().unwrap());
        assert_eq!(
            v4,
            vec![
                "turn:203.0.113.7:3478?transport=udp".to_string(),
                "stun:203.0.113.7:3478".to_string(),
            ]
        );

        let v6 = relay_urls("[2001:db8::1]:3478".parse().unwrap());
        assert_eq!(v6[0], "turn:[2001:db8::1]:3478?transport=udp");
    }

    #[test]
    fn test_auth_handler_matches_minted_credential() {
        let minter = CredentialMinter::new(
            Some(SharedSecret::new("relay-secret")),
            "speedtest",
            600,
            3600,
            vec![],
        );
        let cred = minter.mint(Some(600), Utc::now()).unwrap();
        let handler = RelayAuthHandler::new(minter.authenticator().unwrap());

        let key = handler
            .auth_handle(&cred.username, "speedtest", "127.0.0.1:5000".parse().unwrap())
            .unwrap();

        assert_eq!(key, generate_auth_key(&cred.username, "speedtest", &cred.credential));
    }

    #[test]
    fn test_auth_handler_rejects_expired_and_malformed() {
        let handler = RelayAuthHandler::new(RelayAuthenticator::new(SharedSecret::new("s")));
        let src: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let expired = format!("{}:abcd", Utc::now().timestamp() - 10);
        assert!(handler.auth_handle(&expired, "speedtest", src).is_err());
        assert!(handler.auth_handle("no-expiry", "speedtest", src).is_err());
        assert!(handler.auth_handle("123:", "speedtest", src).is_err());
    }
}
