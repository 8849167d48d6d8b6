//! webrtc-rs backed peer transport.
//!
//! Callbacks registered on the peer connection and on the probe data channel
//! do nothing but forward into the session's event queue.

use super::transport::{
    EventSender, IceServer, PeerState, PeerTransport, TransportConnector, TransportError,
    TransportEvent, PROBE_CHANNEL_LABEL,
};
use crate::config::ProbeConfig;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Network knobs for the server side of each peer connection.
#[derive(Debug, Clone, Default)]
pub struct WebRtcSettings {
    pub udp_port_range: Option<(u16, u16)>,
    pub nat_1to1_ip: Option<String>,
}

impl From<&ProbeConfig> for WebRtcSettings {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            udp_port_range: config.udp_port_min.zip(config.udp_port_max),
            nat_1to1_ip: config.nat_1to1_ip.clone(),
        }
    }
}

pub struct WebRtcConnector {
    api: API,
}

impl WebRtcConnector {
    pub fn new(settings: &WebRtcSettings) -> Result<Self, TransportError> {
        let mut setting_engine = SettingEngine::default();

        if let Some((min, max)) = settings.udp_port_range {
            let ephemeral =
                EphemeralUDP::new(min, max).map_err(|e| TransportError::Setup(e.to_string()))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
            info!("WebRTC UDP port range: {}-{}", min, max);
        }

        if let Some(ip) = &settings.nat_1to1_ip {
            setting_engine.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
            info!("WebRTC 1:1 NAT address: {}", ip);
        }

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl TransportConnector for WebRtcConnector {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
        events: EventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?,
        );

        let transport = Arc::new(WebRtcTransport {
            pc: Arc::clone(&pc),
            channel: Arc::new(Mutex::new(None)),
            gather_rx: Mutex::new(None),
        });

        let state_tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = state_tx.send(TransportEvent::StateChanged(map_state(state)));
            Box::pin(async {})
        }));

        let channel_slot = Arc::clone(&transport.channel);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel_slot = Arc::clone(&channel_slot);
            let events = events.clone();
            Box::pin(async move {
                if dc.label() != PROBE_CHANNEL_LABEL {
                    debug!(label = %dc.label(), "ignoring unexpected data channel");
                    return;
                }
                *channel_slot.lock() = Some(Arc::clone(&dc));
                attach_channel_callbacks(&dc, events);
            })
        }));

        Ok(transport as Arc<dyn PeerTransport>)
    }
}

fn attach_channel_callbacks(dc: &Arc<RTCDataChannel>, events: EventSender) {
    let open_tx = events.clone();
    dc.on_open(Box::new(move || {
        let _ = open_tx.send(TransportEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let message_tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = message_tx.send(TransportEvent::Message(msg.data));
        Box::pin(async {})
    }));

    dc.on_close(Box::new(move || {
        let _ = events.send(TransportEvent::ChannelClosed);
        Box::pin(async {})
    }));
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    gather_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn apply_offer(&self, offer_sdp: &str) -> Result<(), TransportError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| TransportError::InvalidOffer(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| TransportError::InvalidOffer(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;

        // Must be taken before set_local_description starts gathering.
        let gather_rx = self.pc.gathering_complete_promise().await;
        *self.gather_rx.lock() = Some(gather_rx);

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn gathering_complete(&self) {
        let rx = self.gather_rx.lock().take();
        if let Some(mut rx) = rx {
            let _ = rx.recv().await;
        }
    }

    async fn local_answer(&self) -> Result<String, TransportError> {
        self.pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| TransportError::Negotiation("no local description".to_string()))
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let dc = self
            .channel
            .lock()
            .clone()
            .ok_or(TransportError::ChannelNotOpen)?;
        let text =
            String::from_utf8(payload.to_vec()).map_err(|e| TransportError::Send(e.to_string()))?;
        dc.send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let dc = self.channel.lock().take();
        if let Some(dc) = dc {
            if let Err(e) = dc.close().await {
                debug!(error = %e, "data channel close failed");
            }
        }
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}
