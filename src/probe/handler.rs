//! Per-session loss-probe state machine.
//!
//! `Armed → Open → Closed`. The handler only echoes: every valid probe is
//! counted and answered with an acknowledgment, in processing order. Loss,
//! RTT and jitter are computed by the client from the exchange.
//!
//! Duplicate sequence numbers are treated as fresh probes (counted and
//! acknowledged again). `totalReceived` can therefore exceed the number of
//! distinct sequence numbers.

use super::codec::{decode_probe, encode_ack, Acknowledgment};
use crate::session::{Session, SessionStore};
use crate::signaling::transport::{EventReceiver, TransportEvent};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Attached to the session, channel not open yet.
    Armed,
    Open,
    Closed,
}

pub struct LossProbeHandler {
    session: Arc<Session>,
    state: ProbeState,
}

impl LossProbeHandler {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            state: ProbeState::Armed,
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    pub fn on_channel_open(&mut self, now: DateTime<Utc>) {
        if self.state != ProbeState::Armed {
            return;
        }
        self.state = ProbeState::Open;
        self.session.update_stats(|stats| stats.started_at = Some(now));
        info!(session_id = %self.session.id(), "probe channel open");
    }

    /// Count a probe and build its acknowledgment. Malformed payloads and
    /// anything outside `Open` yield `None` and leave the counters alone.
    pub fn on_message(&mut self, payload: &[u8], now: DateTime<Utc>) -> Option<Acknowledgment> {
        if self.state != ProbeState::Open {
            debug!(session_id = %self.session.id(), state = ?self.state, "probe outside open channel dropped");
            return None;
        }

        let probe = match decode_probe(payload) {
            Ok(probe) => probe,
            Err(e) => {
                warn!(session_id = %self.session.id(), error = %e, "dropping probe");
                return None;
            }
        };

        self.session.update_stats(|stats| {
            stats.total_received += 1;
            stats.last_seq = Some(probe.seq);
            stats.last_received_at = Some(now);
        });

        Some(Acknowledgment::for_probe(&probe, now.timestamp_millis()))
    }

    /// Returns `true` on the transition, `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ProbeState::Closed {
            return false;
        }
        self.state = ProbeState::Closed;
        let stats = self.session.stats();
        info!(
            session_id = %self.session.id(),
            total_received = stats.total_received,
            last_seq = ?stats.last_seq,
            "probe handler closed"
        );
        true
    }

    /// Consume the session's event queue until the session closes, the queue
    /// ends, or the transport reaches a terminal state (which removes the
    /// session from `store`).
    pub async fn run(mut self, mut events: EventReceiver, store: Arc<SessionStore>) {
        let cancel = self.session.cancellation();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::ChannelOpen => self.on_channel_open(Utc::now()),
                TransportEvent::Message(payload) => {
                    if let Some(ack) = self.on_message(&payload, Utc::now()) {
                        self.send_ack(ack).await;
                    }
                }
                TransportEvent::ChannelClosed => {
                    self.close();
                }
                TransportEvent::StateChanged(state) => {
                    debug!(session_id = %self.session.id(), ?state, "peer state changed");
                    self.session.set_peer_state(state);
                    if state.is_terminal() {
                        info!(session_id = %self.session.id(), ?state, "transport ended, removing session");
                        self.close();
                        store.remove(self.session.id()).await;
                        break;
                    }
                }
            }
        }

        self.close();
    }

    async fn send_ack(&self, ack: Acknowledgment) {
        let Some(transport) = self.session.transport() else {
            return;
        };
        let payload = match encode_ack(&ack) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session_id = %self.session.id(), error = %e, "ack encode failed");
                return;
            }
        };
        if let Err(e) = transport.send(payload).await {
            warn!(session_id = %self.session.id(), seq = ack.ack, error = %e, "ack send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::codec::{decode_ack, encode_probe, Probe};
    use crate::signaling::testing::FakeTransport;
    use crate::signaling::transport::PeerState;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn probe_bytes(seq: u64, sent_at: i64) -> Bytes {
        encode_probe(&Probe {
            seq,
            sent_at,
            size: 64,
        })
        .unwrap()
    }

    fn open_handler(store: &SessionStore) -> (Arc<Session>, LossProbeHandler) {
        let session = store.create(None);
        let mut handler = LossProbeHandler::new(Arc::clone(&session));
        handler.on_channel_open(Utc::now());
        (session, handler)
    }

    #[test]
    fn test_out_of_order_and_duplicates() {
        let store = SessionStore::new();
        let (session, mut handler) = open_handler(&store);

        let acks: Vec<Acknowledgment> = [5u64, 3, 3, 9]
            .iter()
            .filter_map(|&seq| handler.on_message(&probe_bytes(seq, 1000 + seq as i64), Utc::now()))
            .collect();

        // duplicates are acknowledged again, not deduplicated
        assert_eq!(acks.len(), 4);
        assert_eq!(acks.iter().map(|a| a.ack).collect::<Vec<_>>(), vec![5, 3, 3, 9]);
        for ack in &acks {
            assert_eq!(ack.sent_at, 1000 + ack.ack as i64);
        }

        let stats = session.stats();
        assert_eq!(stats.total_received, 4);
        assert_eq!(stats.last_seq, Some(9));
        assert!(stats.last_received_at.is_some());
    }

    #[test]
    fn test_malformed_probe_dropped() {
        let store = SessionStore::new();
        let (session, mut handler) = open_handler(&store);

        assert!(handler.on_message(b"{garbage", Utc::now()).is_none());
        assert!(handler.on_message(br#"{"seq":-3,"sentAt":1}"#, Utc::now()).is_none());
        assert_eq!(session.stats().total_received, 0);
        assert_eq!(session.stats().last_seq, None);

        assert!(handler.on_message(&probe_bytes(1, 1), Utc::now()).is_some());
        assert_eq!(handler.state(), ProbeState::Open);
    }

    #[test]
    fn test_state_transitions() {
        let store = SessionStore::new();
        let session = store.create(None);
        let mut handler = LossProbeHandler::new(Arc::clone(&session));

        assert_eq!(handler.state(), ProbeState::Armed);
        assert!(handler.on_message(&probe_bytes(0, 1), Utc::now()).is_none());
        assert!(session.stats().started_at.is_none());

        let opened_at = Utc::now();
        handler.on_channel_open(opened_at);
        assert_eq!(handler.state(), ProbeState::Open);
        assert_eq!(session.stats().started_at, Some(opened_at));

        assert!(handler.close());
        assert!(!handler.close());
        assert_eq!(handler.state(), ProbeState::Closed);

        handler.on_channel_open(Utc::now());
        assert_eq!(handler.state(), ProbeState::Closed);
        assert!(handler.on_message(&probe_bytes(1, 1), Utc::now()).is_none());
    }

    #[test]
    fn test_armed_can_close() {
        let store = SessionStore::new();
        let mut handler = LossProbeHandler::new(store.create(None));
        assert!(handler.close());
        assert_eq!(handler.state(), ProbeState::Closed);
    }

    #[tokio::test]
    async fn test_run_echoes_acks_in_processing_order() {
        let store = Arc::new(SessionStore::new());
        let session = store.create(None);
        let transport = FakeTransport::new();
        session.attach_transport(transport.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(LossProbeHandler::new(Arc::clone(&session)).run(rx, Arc::clone(&store)));

        tx.send(TransportEvent::ChannelOpen).unwrap();
        for seq in [2u64, 0, 1] {
            tx.send(TransportEvent::Message(probe_bytes(seq, 77))).unwrap();
        }
        tx.send(TransportEvent::Message(Bytes::from_static(b"nope"))).unwrap();

        transport.wait_for_sent(3, Duration::from_secs(2)).await;
        let acks: Vec<u64> = transport
            .sent()
            .iter()
            .map(|b| decode_ack(b).unwrap().ack)
            .collect();
        assert_eq!(acks, vec![2, 0, 1]);

        session.close().await;
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_removes_session_on_transport_failure() {
        let store = Arc::new(SessionStore::new());
        let session = store.create(None);
        let transport = FakeTransport::new();
        session.attach_transport(transport.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(LossProbeHandler::new(Arc::clone(&session)).run(rx, Arc::clone(&store)));

        tx.send(TransportEvent::StateChanged(PeerState::Connected)).unwrap();
        tx.send(TransportEvent::StateChanged(PeerState::Failed)).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(store.get(session.id()).is_none());
        assert_eq!(session.peer_state(), PeerState::Failed);
        assert!(session.is_closed());
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_channel_close_keeps_session() {
        let store = Arc::new(SessionStore::new());
        let session = store.create(None);

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(LossProbeHandler::new(Arc::clone(&session)).run(rx, Arc::clone(&store)));

        tx.send(TransportEvent::ChannelOpen).unwrap();
        tx.send(TransportEvent::ChannelClosed).unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(store.get(session.id()).is_some());
    }
}
