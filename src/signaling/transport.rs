//! Peer-transport capability seam.
//!
//! The signaling handler drives a [`PeerTransport`] and observes it through
//! [`TransportEvent`]s. Every asynchronous notification of one connection
//! (state change, channel open/close, inbound message) goes into a single
//! per-session queue so one task owns the session's probe state.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Label of the data channel that carries probes.
pub const PROBE_CHANNEL_LABEL: &str = "loss-probe";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid offer: {0}")]
    InvalidOffer(String),
    #[error("failed to create peer connection: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("close failed: {0}")]
    Close(String),
}

/// Connection-level state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// States after which the session is torn down.
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed | PeerState::Closed)
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(PeerState),
    /// The probe channel (label [`PROBE_CHANNEL_LABEL`]) opened.
    ChannelOpen,
    Message(Bytes),
    ChannelClosed,
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// ICE server entry handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// One negotiated peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Apply the remote offer, create the answer and set it locally.
    /// Gathering starts here.
    async fn apply_offer(&self, offer_sdp: &str) -> Result<(), TransportError>;

    /// Resolves once candidate gathering has finished. Callers bound it.
    async fn gathering_complete(&self);

    /// The local answer, including gathered candidates.
    async fn local_answer(&self) -> Result<String, TransportError>;

    /// Send one message on the probe channel.
    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates transports. Events of the new connection go to `events`.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
        events: EventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
