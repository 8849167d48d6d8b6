//! In-memory transport used by unit tests in place of webrtc-rs.

use super::transport::{
    EventSender, IceServer, PeerTransport, TransportConnector, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeMode {
    Ok,
    /// Gathering never completes.
    Stalled,
    /// `apply_offer` rejects the SDP.
    RejectOffer,
    /// Gathering completes after the given delay.
    Delayed(Duration),
}

pub struct FakeTransport {
    mode: FakeMode,
    sent: Mutex<Vec<Bytes>>,
    closes: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Self::with_mode(FakeMode::Ok)
    }

    pub fn with_mode(mode: FakeMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            sent: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Poll until `count` messages were sent; panics after `timeout`.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.sent.lock().len() < count {
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "expected {} sent messages, got {}",
                    count,
                    self.sent.lock().len()
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn apply_offer(&self, offer_sdp: &str) -> Result<(), TransportError> {
        if self.mode == FakeMode::RejectOffer || !offer_sdp.starts_with("v=0") {
            return Err(TransportError::InvalidOffer("unparsable SDP".to_string()));
        }
        Ok(())
    }

    async fn gathering_complete(&self) {
        match self.mode {
            FakeMode::Stalled => std::future::pending::<()>().await,
            FakeMode::Delayed(delay) => tokio::time::sleep(delay).await,
            FakeMode::Ok | FakeMode::RejectOffer => {}
        }
    }

    async fn local_answer(&self) -> Result<String, TransportError> {
        Ok("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=answer\r\n".to_string())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeConnector {
    mode: FakeMode,
    fail_connect: bool,
    connections: Mutex<Vec<(Arc<FakeTransport>, EventSender)>>,
    ice_servers: Mutex<Vec<IceServer>>,
}

impl FakeConnector {
    pub fn new(mode: FakeMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            fail_connect: false,
            connections: Mutex::new(Vec::new()),
            ice_servers: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            mode: FakeMode::Ok,
            fail_connect: true,
            connections: Mutex::new(Vec::new()),
            ice_servers: Mutex::new(Vec::new()),
        })
    }

    /// Most recent transport and the event queue feeding its session.
    pub fn last(&self) -> Option<(Arc<FakeTransport>, EventSender)> {
        self.connections.lock().last().cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers.lock().clone()
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
        events: EventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if self.fail_connect {
            return Err(TransportError::Setup("connector disabled".to_string()));
        }
        *self.ice_servers.lock() = ice_servers.to_vec();
        let transport = FakeTransport::with_mode(self.mode);
        self.connections.lock().push((Arc::clone(&transport), events));
        Ok(transport as Arc<dyn PeerTransport>)
    }
}
