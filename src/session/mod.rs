//! Session management
//!
//! Holds per-client session state across disconnects, and owns each
//! session's [`OfflineMessageQueue`]. Packet identifier assignment, inflight
//! QoS 1/2 tracking, subscription matching, and topic alias bookkeeping are
//! connection/router concerns that live outside this crate.

mod offline_queue;
mod timer;

pub use offline_queue::{Endpoint, OfflineMessage, OfflineMessageQueue, PublishError};
pub use timer::{ExpiryTimerHandle, FireOutcome, TimerId, TimerService};

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session is connected
    Connected,
    /// Session is disconnected but persisted
    Disconnected,
}

/// Client session
///
/// Created with `clean_start=true` (no offline queue retained past the
/// connection's lifetime) or resumed with `clean_start=false` (offline queue
/// persists and accumulates messages while disconnected).
pub struct Session {
    pub client_id: Arc<str>,
    pub state: SessionState,
    pub clean_start: bool,
    /// Seconds to retain the session after disconnect; `0` means delete on
    /// disconnect, `0xFFFFFFFF` means never expire.
    pub session_expiry_interval: u32,
    pub created_at: Instant,
    pub disconnected_at: Option<Instant>,
    /// Messages queued while this session is disconnected.
    pub offline_queue: OfflineMessageQueue,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean_start: bool, session_expiry_interval: u32) -> Self {
        Self {
            client_id,
            state: SessionState::Connected,
            clean_start,
            session_expiry_interval,
            created_at: Instant::now(),
            disconnected_at: None,
            offline_queue: OfflineMessageQueue::new(),
        }
    }

    pub fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
        self.disconnected_at = Some(Instant::now());
    }

    pub fn reconnect(&mut self) {
        self.state = SessionState::Connected;
        self.disconnected_at = None;
    }

    /// Whether this disconnected session's retention window has elapsed.
    pub fn is_expired(&self) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }
        if self.session_expiry_interval == 0 {
            return true;
        }
        if self.session_expiry_interval == 0xFFFF_FFFF {
            return false;
        }
        match self.disconnected_at {
            Some(at) => at.elapsed() >= Duration::from_secs(self.session_expiry_interval as u64),
            None => false,
        }
    }

    /// Drop all retained state, including any queued offline messages, for a
    /// session takeover with `clean_start=true`.
    pub fn clear(&mut self) {
        self.offline_queue.clear();
    }
}

/// Thread-safe session store keyed by client identifier.
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Resume a previously disconnected session, or create a fresh one.
    ///
    /// Returns `(session, resumed)`. A `clean_start` request always yields a
    /// fresh session, clearing any prior offline queue first. Resuming an
    /// expired session is treated the same as a fresh connect.
    pub fn get_or_create(
        &self,
        client_id: &str,
        clean_start: bool,
        session_expiry_interval: u32,
    ) -> (Arc<RwLock<Session>>, bool) {
        let client_id: Arc<str> = client_id.into();

        if !clean_start {
            if let Some(existing) = self.sessions.get(&client_id) {
                let mut session = existing.write();
                if !session.is_expired() {
                    session.reconnect();
                    session.session_expiry_interval = session_expiry_interval;
                    drop(session);
                    return (existing.clone(), true);
                }
            }
        }

        let session = Arc::new(RwLock::new(Session::new(
            client_id.clone(),
            clean_start,
            session_expiry_interval,
        )));
        self.sessions.insert(client_id, session.clone());
        (session, false)
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    /// Mark a session disconnected; drop it immediately if its expiry
    /// interval is zero.
    pub fn disconnect(&self, client_id: &str) {
        let should_remove = match self.sessions.get(client_id) {
            Some(session) => {
                let mut s = session.write();
                s.disconnect();
                s.session_expiry_interval == 0
            }
            None => false,
        };

        if should_remove {
            self.sessions.remove(client_id);
        }
    }

    /// Evict sessions whose retention window has elapsed. Intended to be
    /// called periodically by the broker's ticker.
    pub fn cleanup_expired(&self) {
        self.sessions.retain(|_, session| !session.read().is_expired());
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_start_always_creates_fresh_session() {
        let store = SessionStore::new();
        let (session, resumed) = store.get_or_create("client-1", true, 0);
        assert!(!resumed);
        assert_eq!(session.read().client_id.as_ref(), "client-1");
    }

    #[test]
    fn resume_picks_up_existing_offline_queue() {
        let store = SessionStore::new();
        let (session, _) = store.get_or_create("client-1", false, 300);
        session
            .read()
            .offline_queue
            .enqueue(
                &TimerService::new(),
                Arc::from("t"),
                bytes::Bytes::from_static(b"p"),
                crate::protocol::PublishOptions::default(),
                crate::protocol::Properties::default(),
            );
        store.disconnect("client-1");

        let (resumed_session, resumed) = store.get_or_create("client-1", false, 300);
        assert!(resumed);
        assert!(!resumed_session.read().offline_queue.is_empty());
    }

    #[test]
    fn zero_expiry_interval_drops_session_on_disconnect() {
        let store = SessionStore::new();
        store.get_or_create("client-1", true, 0);
        store.disconnect("client-1");
        assert!(store.get("client-1").is_none());
    }

    #[test]
    fn clean_start_clears_prior_offline_queue() {
        let store = SessionStore::new();
        let (session, _) = store.get_or_create("client-1", false, 300);
        session
            .read()
            .offline_queue
            .enqueue(
                &TimerService::new(),
                Arc::from("t"),
                bytes::Bytes::from_static(b"p"),
                crate::protocol::PublishOptions::default(),
                crate::protocol::Properties::default(),
            );
        store.disconnect("client-1");

        let (fresh_session, resumed) = store.get_or_create("client-1", true, 0);
        assert!(!resumed);
        assert!(fresh_session.read().offline_queue.is_empty());
    }
}
