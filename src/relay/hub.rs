//! Single owner of the connection table and the session registry.
//!
//! Every admission and release goes through the hub, which updates both
//! structures in the same call: an occupied table slot always has a
//! registry entry for the same slot, and vice versa.

use crate::relay::session::{Session, SessionRegistry};
use crate::relay::table::{ConnectionTable, SlotId};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use tracing::info;

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent `-q`.
    Quit,
    /// Zero-byte read: the peer closed its end.
    PeerClosed,
    /// Read failed.
    ReadError,
    /// Delivering a broadcast to this peer failed.
    WriteError,
    /// This peer's outbound queue exceeded its limit.
    Overflow,
}

/// Connection handed back because the table is at capacity.
#[derive(Debug)]
pub struct Rejected<C>(pub C);

impl<C> Rejected<C> {
    pub fn into_inner(self) -> C {
        self.0
    }
}

/// Connection table plus session registry, kept consistent.
pub struct Hub<C> {
    table: ConnectionTable<C>,
    registry: SessionRegistry,
}

impl<C> Hub<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: ConnectionTable::new(capacity),
            registry: SessionRegistry::new(),
        }
    }

    /// Place a connection in the lowest free slot and record its session.
    pub fn admit(&mut self, conn: C, peer: SocketAddr) -> Result<SlotId, Rejected<C>> {
        let slot = self.table.insert(conn).map_err(Rejected)?;
        let previous = self.registry.insert(Session::new(slot, peer));
        debug_assert!(previous.is_none(), "registry entry for a free slot");
        Ok(slot)
    }

    /// Mark a session as connected once its socket is being watched.
    pub fn mark_connected(&mut self, slot: SlotId) {
        if let Some(session) = self.registry.get_mut(slot) {
            session.connect();
        }
    }

    /// Free a slot and drop its session together.
    pub fn release(&mut self, slot: SlotId) -> Option<(C, Session)> {
        let conn = self.table.remove(slot)?;
        let mut session = self.registry.remove(slot)?;
        session.close();
        Some((conn, session))
    }

    pub fn session(&self, slot: SlotId) -> Option<&Session> {
        self.registry.get(slot)
    }

    pub fn connection(&self, slot: SlotId) -> Option<&C> {
        self.table.get(slot)
    }

    pub fn connection_mut(&mut self, slot: SlotId) -> Option<&mut C> {
        self.table.get_mut(slot)
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        self.table.contains(slot)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.table.is_full()
    }

    /// Iterate over live sessions in no particular order.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.registry.iter()
    }

    /// Occupied slots other than `sender`, ascending.
    pub fn peer_slots(&self, sender: SlotId) -> Vec<SlotId> {
        self.table
            .iter()
            .map(|(slot, _)| slot)
            .filter(|&slot| slot != sender)
            .collect()
    }

    /// Build the wire frame `"<sender address>: <payload>"`.
    pub fn frame(&self, sender: SlotId, payload: &[u8]) -> Option<Bytes> {
        let address = self.registry.get(sender)?.remote_address();
        let mut frame = BytesMut::with_capacity(address.len() + 2 + payload.len());
        frame.put_slice(address.as_bytes());
        frame.put_slice(b": ");
        frame.put_slice(payload);
        Some(frame.freeze())
    }

    /// Check that table occupancy and registry entries agree.
    pub fn is_consistent(&self) -> bool {
        self.table.len() == self.registry.len()
            && self.table.iter().all(|(slot, _)| {
                self.registry
                    .get(slot)
                    .is_some_and(|session| session.slot() == slot)
            })
    }
}

/// Log a torn-down session.
pub fn log_release(session: &Session, reason: CloseReason) {
    let duration_ms = session.age().num_milliseconds();
    match reason {
        CloseReason::Quit => info!(
            slot = %session.slot(),
            peer = %session.remote_address(),
            duration_ms,
            "Closed {}",
            session.remote_address()
        ),
        _ => info!(
            slot = %session.slot(),
            peer = %session.remote_address(),
            reason = ?reason,
            duration_ms,
            "Peer disconnected"
        ),
    }
}
