//! Session registry.
//!
//! The map lock only guards membership. Each [`Session`] carries its own
//! stats lock, and teardown goes through an atomic one-shot flag so report,
//! transport failure and sweep can race freely.

use crate::signaling::transport::{PeerState, PeerTransport};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Server-side probe counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_received: u64,
    pub last_seq: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
}

pub struct Session {
    id: String,
    created_at: Instant,
    profile: Option<String>,
    transport: Mutex<Option<Arc<dyn PeerTransport>>>,
    stats: Mutex<SessionStats>,
    peer_state: Mutex<PeerState>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Session {
    fn new(profile: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Instant::now(),
            profile,
            transport: Mutex::new(None),
            stats: Mutex::new(SessionStats::default()),
            peer_state: Mutex::new(PeerState::New),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    /// Age relative to `now`; zero if `now` precedes creation.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fires when the session is closed.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Hand the transport to the session. Returns `false` if the session
    /// was already closed; the caller still owns `transport` then.
    pub fn attach_transport(&self, transport: Arc<dyn PeerTransport>) -> bool {
        let mut slot = self.transport.lock();
        if self.is_closed() {
            return false;
        }
        *slot = Some(transport);
        true
    }

    pub fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.transport.lock().clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.lock().clone()
    }

    /// Last connection state reported by the transport.
    pub fn peer_state(&self) -> PeerState {
        *self.peer_state.lock()
    }

    pub fn set_peer_state(&self, state: PeerState) {
        *self.peer_state.lock() = state;
    }

    pub fn update_stats<R>(&self, f: impl FnOnce(&mut SessionStats) -> R) -> R {
        f(&mut self.stats.lock())
    }

    /// Single terminal transition. The first caller cancels the handler and
    /// releases the transport; later callers get `false`.
    pub async fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.cancel.cancel();

        // Taken under the same lock attach_transport checks `closed` under.
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                warn!(session_id = %self.id, error = %e, "transport close failed");
            }
        }

        debug!(session_id = %self.id, "session closed");
        true
    }
}

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a session and register it.
    pub fn create(&self, profile: Option<String>) -> Arc<Session> {
        let session = Arc::new(Session::new(profile));
        self.sessions
            .write()
            .insert(session.id.clone(), Arc::clone(&session));
        info!(session_id = %session.id, "📋 session created");
        session
    }

    /// Like [`create`](Self::create), but refuses once `limit` sessions are
    /// registered. The check and the insert share one write lock.
    pub fn try_create(&self, limit: usize, profile: Option<String>) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= limit {
            return None;
        }
        let session = Arc::new(Session::new(profile));
        sessions.insert(session.id.clone(), Arc::clone(&session));
        drop(sessions);
        info!(session_id = %session.id, "📋 session created");
        Some(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Unregister and close. Absent ids are a no-op.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id);
        match removed {
            Some(session) => {
                session.close().await;
                info!(session_id = %id, "📋 session removed");
                true
            }
            None => false,
        }
    }

    /// Run `action` on every session matching `predicate`, under the read
    /// lock. `action` must not call back into the store.
    pub fn for_each<P, A>(&self, mut predicate: P, mut action: A)
    where
        P: FnMut(&Session) -> bool,
        A: FnMut(&Arc<Session>),
    {
        let sessions = self.sessions.read();
        for session in sessions.values() {
            if predicate(session) {
                action(session);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and drop everything (shutdown).
    pub async fn clear(&self) {
        let drained: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in drained {
            session.close().await;
        }
    }
}
