//! Peer-transport negotiation for loss-probe sessions.

pub mod handler;
pub mod transport;
pub mod webrtc;

#[cfg(test)]
pub mod testing;

pub use handler::{OfferAnswer, OfferRequest, SignalingError, SignalingHandler};
pub use transport::{
    IceServer, PeerState, PeerTransport, TransportConnector, TransportError, TransportEvent,
};
pub use self::webrtc::{WebRtcConnector, WebRtcSettings};
