//! Session records and the registry that owns them.

use crate::relay::table::SlotId;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Slot assigned, socket not yet watched.
    Connecting,
    /// Watched and relaying.
    Connected,
    /// Torn down. Terminal.
    Closed,
}

/// One connected client.
#[derive(Debug, Clone)]
pub struct Session {
    slot: SlotId,
    remote_address: String,
    connected_at: DateTime<Utc>,
    state: SessionState,
}

impl Session {
    pub fn new(slot: SlotId, peer: SocketAddr) -> Self {
        Self {
            slot,
            remote_address: peer.to_string(),
            connected_at: Utc::now(),
            state: SessionState::Connecting,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Peer address captured at accept time.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Time since the session was accepted.
    pub fn age(&self) -> Duration {
        Utc::now() - self.connected_at
    }

    /// Transition to connected. No effect once closed.
    pub fn connect(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Connected;
        }
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

/// Keyed store of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SlotId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session under its own slot, returning any previous occupant.
    pub fn insert(&mut self, session: Session) -> Option<Session> {
        self.sessions.insert(session.slot(), session)
    }

    pub fn get(&self, slot: SlotId) -> Option<&Session> {
        self.sessions.get(&slot)
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut Session> {
        self.sessions.get_mut(&slot)
    }

    pub fn remove(&mut self, slot: SlotId) -> Option<Session> {
        self.sessions.remove(&slot)
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        self.sessions.contains_key(&slot)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_session_state_transitions() {
        let mut session = Session::new(SlotId::new(3), peer(4000));
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.remote_address(), "10.0.0.1:4000");

        session.connect();
        assert_eq!(session.state(), SessionState::Connected);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);

        // Closed is terminal
        session.connect();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_registry_keyed_by_slot() {
        let mut registry = SessionRegistry::new();
        assert!(registry
            .insert(Session::new(SlotId::new(0), peer(1)))
            .is_none());
        assert!(registry
            .insert(Session::new(SlotId::new(1), peer(2)))
            .is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get(SlotId::new(1)).unwrap().remote_address(),
            "10.0.0.1:2"
        );

        let removed = registry.remove(SlotId::new(0)).unwrap();
        assert_eq!(removed.slot(), SlotId::new(0));
        assert!(!registry.contains(SlotId::new(0)));
        assert_eq!(registry.iter().count(), 1);
    }

    #[test]
    fn test_age_is_non_negative() {
        let session = Session::new(SlotId::new(0), peer(1));
        assert!(session.age() >= Duration::zero());
        assert!(session.connected_at() <= Utc::now());
    }
}
