//! Hub actor - owns the hub and serializes every mutation.
//!
//! Connection tasks never touch the hub directly. They send `HubCommand`s
//! over an mpsc channel; the actor processes them one at a time, so two
//! joins can never be handed the same slot and a broadcast never iterates
//! the table while it is being changed.

use crate::error::RelayError;
use crate::relay::hub::{log_release, CloseReason, Hub};
use crate::relay::table::SlotId;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Capacity of the command channel into the actor.
const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Identifies one session incarnation.
///
/// Slots are reused, so a command from a session that has already been
/// evicted must not act on whoever holds the slot now; the ticket tells
/// them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKey {
    pub slot: SlotId,
    ticket: u64,
}

/// The hub's view of one connection: its send path and its stop signal.
///
/// Dropping the handle closes the outbound queue (the writer task ends and
/// shuts the socket down) and fires the reader's stop signal.
pub struct PeerHandle {
    ticket: u64,
    outbound: mpsc::Sender<Bytes>,
    _stop: oneshot::Sender<()>,
}

impl PeerHandle {
    pub fn new(outbound: mpsc::Sender<Bytes>, stop: oneshot::Sender<()>) -> Self {
        Self {
            ticket: 0,
            outbound,
            _stop: stop,
        }
    }
}

/// Commands accepted by the actor.
pub enum HubCommand {
    /// Admit a new connection.
    Join {
        peer: SocketAddr,
        handle: PeerHandle,
        respond_to: oneshot::Sender<Option<SessionKey>>,
    },
    /// Relay a line to every other session.
    Broadcast { from: SessionKey, payload: Bytes },
    /// Tear a session down.
    Leave {
        key: SessionKey,
        reason: CloseReason,
    },
    /// Report live sessions as `(slot, address)`, plus whether the hub is consistent.
    #[cfg(test)]
    Snapshot {
        respond_to: oneshot::Sender<(Vec<(SlotId, String)>, bool)>,
    },
}

/// The hub actor.
pub struct HubActor {
    receiver: mpsc::Receiver<HubCommand>,
    hub: Hub<PeerHandle>,
    next_ticket: u64,
}

impl HubActor {
    pub fn new(receiver: mpsc::Receiver<HubCommand>, capacity: usize) -> Self {
        Self {
            receiver,
            hub: Hub::new(capacity),
            next_ticket: 1,
        }
    }

    /// Process commands until every handle is dropped.
    pub async fn run(mut self) {
        debug!(capacity = self.hub.capacity(), "Hub actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        debug!(sessions = self.hub.len(), "Hub actor stopped");
    }

    fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Join {
                peer,
                handle,
                respond_to,
            } => {
                let key = self.handle_join(peer, handle);
                // Ignore send error - the connection task may be gone
                let _ = respond_to.send(key);
            }
            HubCommand::Broadcast { from, payload } => self.handle_broadcast(from, &payload),
            HubCommand::Leave { key, reason } => {
                if self.is_current(key) {
                    self.release(key.slot, reason);
                }
            }
            #[cfg(test)]
            HubCommand::Snapshot { respond_to } => {
                let mut sessions: Vec<_> = self
                    .hub
                    .sessions()
                    .map(|s| (s.slot(), s.remote_address().to_string()))
                    .collect();
                sessions.sort();
                let _ = respond_to.send((sessions, self.hub.is_consistent()));
            }
        }
    }

    fn handle_join(&mut self, peer: SocketAddr, mut handle: PeerHandle) -> Option<SessionKey> {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        handle.ticket = ticket;

        match self.hub.admit(handle, peer) {
            Ok(slot) => {
                self.hub.mark_connected(slot);
                debug!(slot = %slot, peer = %peer, sessions = self.hub.len(), "Accepted connection");
                Some(SessionKey { slot, ticket })
            }
            Err(_rejected) => {
                warn!(
                    peer = %peer,
                    capacity = self.hub.capacity(),
                    "Too many clients, rejecting connection"
                );
                None
            }
        }
    }

    fn handle_broadcast(&mut self, from: SessionKey, payload: &[u8]) {
        if !self.is_current(from) {
            return;
        }
        let Some(frame) = self.hub.frame(from.slot, payload) else {
            return;
        };

        let mut failed = Vec::new();
        for peer in self.hub.peer_slots(from.slot) {
            let Some(handle) = self.hub.connection(peer) else {
                continue;
            };
            match handle.outbound.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(slot = %peer, "Outbound queue full, dropping peer");
                    failed.push((peer, CloseReason::Overflow));
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(slot = %peer, "Delivery failed, dropping peer");
                    failed.push((peer, CloseReason::WriteError));
                }
            }
        }

        for (peer, reason) in failed {
            self.release(peer, reason);
        }
    }

    fn is_current(&self, key: SessionKey) -> bool {
        self.hub
            .connection(key.slot)
            .is_some_and(|handle| handle.ticket == key.ticket)
    }

    fn release(&mut self, slot: SlotId, reason: CloseReason) {
        if let Some((_handle, session)) = self.hub.release(slot) {
            log_release(&session, reason);
        }
    }
}

/// Cheap-to-clone interface to the hub actor.
#[derive(Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Ask for a slot. `Ok(None)` means the hub is at capacity.
    pub async fn join(
        &self,
        peer: SocketAddr,
        handle: PeerHandle,
    ) -> Result<Option<SessionKey>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubCommand::Join {
                peer,
                handle,
                respond_to: tx,
            })
            .await
            .map_err(|_| RelayError::HubClosed)?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    pub async fn broadcast(&self, from: SessionKey, payload: Bytes) -> Result<(), RelayError> {
        self.sender
            .send(HubCommand::Broadcast { from, payload })
            .await
            .map_err(|_| RelayError::HubClosed)
    }

    pub async fn leave(&self, key: SessionKey, reason: CloseReason) -> Result<(), RelayError> {
        self.sender
            .send(HubCommand::Leave { key, reason })
            .await
            .map_err(|_| RelayError::HubClosed)
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> Result<(Vec<(SlotId, String)>, bool), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubCommand::Snapshot { respond_to: tx })
            .await
            .map_err(|_| RelayError::HubClosed)?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }
}

/// Spawn the hub actor on the current runtime and return its handle.
pub fn spawn_hub(capacity: usize) -> HubHandle {
    let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    tokio::spawn(HubActor::new(receiver, capacity).run());
    info!(capacity, "Hub actor spawned");
    HubHandle { sender }
}
