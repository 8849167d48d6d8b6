//! Offer/answer negotiation.
//!
//! A session is registered before the transport exists so every failure is
//! logged against its id. Any failure after that point removes the session,
//! which also closes whatever transport was attached.

use super::transport::{IceServer, PeerTransport, TransportConnector, TransportError};
use crate::config::ProbeConfig;
use crate::probe::LossProbeHandler;
use crate::session::{Session, SessionStore};
use crate::turn::CredentialMinter;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifetime of the relay credential the server uses for its own side.
const SERVER_CREDENTIAL_TTL_SEC: i64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid offer: {0}")]
    InvalidOffer(String),
    #[error("signaling is not available")]
    Unavailable,
    #[error("session limit reached ({0})")]
    AtCapacity(usize),
    #[error("transport error: {0}")]
    Transport(TransportError),
    #[error("ICE gathering timed out after {0:?}")]
    GatheringTimeout(Duration),
    #[error("session closed during negotiation")]
    SessionClosed,
}

impl From<TransportError> for SignalingError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::InvalidOffer(reason) => SignalingError::InvalidOffer(reason),
            other => SignalingError::Transport(other),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OfferRequest {
    #[serde(default)]
    pub sdp: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "testProfile", default)]
    pub test_profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OfferAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "testId")]
    pub test_id: String,
}

pub struct SignalingHandler {
    store: Arc<SessionStore>,
    connector: Option<Arc<dyn TransportConnector>>,
    minter: Arc<CredentialMinter>,
    stun_servers: Vec<String>,
    gather_timeout: Duration,
    max_sessions: usize,
}

impl SignalingHandler {
    /// `connector` is `None` when the peer-transport capability is disabled;
    /// offers are then answered with [`SignalingError::Unavailable`].
    pub fn new(
        store: Arc<SessionStore>,
        connector: Option<Arc<dyn TransportConnector>>,
        minter: Arc<CredentialMinter>,
        config: &ProbeConfig,
    ) -> Self {
        Self {
            store,
            connector,
            minter,
            stun_servers: config.ice_servers.clone(),
            gather_timeout: config.gather_timeout(),
            max_sessions: config.max_sessions,
        }
    }

    pub fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = timeout;
        self
    }

    pub fn is_available(&self) -> bool {
        self.connector.is_some()
    }

    pub async fn handle_offer(&self, request: OfferRequest) -> Result<OfferAnswer, SignalingError> {
        validate(&request)?;

        let connector = self.connector.as_ref().ok_or(SignalingError::Unavailable)?;

        let Some(session) = self
            .store
            .try_create(self.max_sessions, request.test_profile)
        else {
            warn!(max_sessions = self.max_sessions, "rejecting offer, session limit reached");
            return Err(SignalingError::AtCapacity(self.max_sessions));
        };
        let session_id = session.id().to_string();

        match self.negotiate(&session, connector.as_ref(), &request.sdp).await {
            Ok(_) if session.is_closed() => {
                warn!(session_id = %session_id, "session closed before the answer was ready");
                self.store.remove(&session_id).await;
                Err(SignalingError::SessionClosed)
            }
            Ok(sdp) => {
                info!(session_id = %session_id, "✅ answer ready");
                Ok(OfferAnswer {
                    sdp,
                    kind: "answer".to_string(),
                    test_id: session_id,
                })
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "negotiation failed, releasing session");
                self.store.remove(&session_id).await;
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        session: &Arc<Session>,
        connector: &dyn TransportConnector,
        offer_sdp: &str,
    ) -> Result<String, SignalingError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = connector.connect(&self.ice_servers(), events_tx).await?;

        if !session.attach_transport(Arc::clone(&transport)) {
            close_detached(&transport, session.id()).await;
            return Err(SignalingError::SessionClosed);
        }

        // Armed before the offer is applied so no event is missed.
        tokio::spawn(
            LossProbeHandler::new(Arc::clone(session)).run(events_rx, Arc::clone(&self.store)),
        );

        transport.apply_offer(offer_sdp).await?;

        tokio::time::timeout(self.gather_timeout, transport.gathering_complete())
            .await
            .map_err(|_| SignalingError::GatheringTimeout(self.gather_timeout))?;

        Ok(transport.local_answer().await?)
    }

    /// STUN servers plus, with a secret configured, the relay servers under
    /// a freshly minted credential.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers: Vec<IceServer> = self.stun_servers.iter().map(IceServer::stun).collect();

        if self.minter.servers().is_empty() {
            return servers;
        }
        match self.minter.mint(Some(SERVER_CREDENTIAL_TTL_SEC), Utc::now()) {
            Ok(credential) => servers.push(IceServer {
                urls: credential.servers,
                username: Some(credential.username),
                credential: Some(credential.credential),
            }),
            Err(e) => {
                debug!(error = %e, "relay servers skipped for server ICE set");
            }
        }
        servers
    }
}

fn validate(request: &OfferRequest) -> Result<(), SignalingError> {
    if request.kind != "offer" {
        return Err(SignalingError::InvalidRequest(format!(
            "type must be \"offer\", got {:?}",
            request.kind
        )));
    }
    if request.sdp.trim().is_empty() {
        return Err(SignalingError::InvalidRequest("sdp is required".to_string()));
    }
    Ok(())
}

async fn close_detached(transport: &Arc<dyn PeerTransport>, session_id: &str) {
    if let Err(e) = transport.close().await {
        warn!(session_id = %session_id, error = %e, "transport close failed");
    }
}
