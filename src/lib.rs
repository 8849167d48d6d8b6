//! PonsWarp Speedtest backend.
//!
//! Issues time-limited relay credentials, negotiates WebRTC sessions from
//! browser offers and answers loss probes on the session's data channel.

pub mod api;
pub mod config;
pub mod probe;
pub mod session;
pub mod signaling;
pub mod turn;

use anyhow::Context;
use api::AppState;
use config::ServerConfig;
use session::{ExpirySweeper, SessionStore};
use signaling::{SignalingHandler, TransportConnector, WebRtcConnector, WebRtcSettings};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use turn::{CredentialMinter, RelayAuthenticator, RelayConfig, RelayServer, SharedSecret};

/// Run the server until Ctrl-C/SIGTERM, then close every session and the
/// embedded relay.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let addr = config.listen_addr()?;
    info!("🚀 PonsWarp Speedtest {} starting", env!("CARGO_PKG_VERSION"));

    let relay = start_relay(&config.relay).await?;
    let derived_servers = relay.as_ref().map(RelayServer::urls).unwrap_or_default();
    let minter = Arc::new(CredentialMinter::from_config(&config.relay, derived_servers));
    if minter.is_configured() {
        info!(realm = %minter.realm(), servers = ?minter.servers(), "relay credentials enabled");
    } else {
        warn!("TURN_SECRET not set, /turn-creds will answer 503");
    }

    let store = Arc::new(SessionStore::new());
    let shutdown = CancellationToken::new();

    let sweeper = ExpirySweeper::new(
        Arc::clone(&store),
        config.probe.sweep_interval(),
        config.probe.session_timeout(),
    )
    .spawn(shutdown.clone());

    let connector: Option<Arc<dyn TransportConnector>> = if config.probe.enabled {
        let settings = WebRtcSettings::from(&config.probe);
        Some(Arc::new(WebRtcConnector::new(&settings)?))
    } else {
        info!("loss probe disabled, offers will answer 503");
        None
    };

    let signaling = Arc::new(SignalingHandler::new(
        Arc::clone(&store),
        connector,
        Arc::clone(&minter),
        &config.probe,
    ));

    let app = api::router(AppState {
        minter,
        signaling,
        store: Arc::clone(&store),
    });

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("🌐 HTTP API listening on {}", listener.local_addr()?);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "sweeper task failed");
    }
    let remaining = store.len();
    store.clear().await;
    info!("🧹 closed {} remaining sessions", remaining);
    if let Some(relay) = relay {
        relay.close().await;
    }

    served.context("HTTP server failed")?;
    info!("✅ PonsWarp Speedtest stopped");
    Ok(())
}

async fn start_relay(config: &RelayConfig) -> anyhow::Result<Option<RelayServer>> {
    if !config.embedded {
        return Ok(None);
    }
    let secret = config
        .secret
        .as_deref()
        .context("embedded relay requires TURN_SECRET")?;
    let authenticator = RelayAuthenticator::new(SharedSecret::new(secret));
    Ok(Some(RelayServer::start(config, authenticator).await?))
}

/// Resolves on Ctrl-C, SIGTERM or when `shutdown` is cancelled elsewhere.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
        _ = shutdown.cancelled() => {}
    }
    info!("🛑 shutting down");
}
