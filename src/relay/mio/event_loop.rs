//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! A single thread owns the listener, the multiplexer, and the hub. The
//! listener is watched under `LISTENER_TOKEN`; every client socket is
//! watched under a token equal to its slot, so a readiness event maps
//! straight back to the session.
//!
//! ## Fairness
//!
//! Readiness is edge-triggered, so a socket that still has unread data
//! after its per-event read budget is spent will not be reported again.
//! Such slots go into a backlog; while the backlog is non-empty the next
//! wait does not block and backlogged slots are served after the fresh
//! events.

use crate::config::{Config, RelaySettings};
use crate::error::{RelayError, RelayResult};
use crate::relay::command::{Command, LineBuffer};
use crate::relay::hub::{log_release, CloseReason, Hub};
use crate::relay::listener::bind_listener;
use crate::relay::table::SlotId;
use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Number of readiness events fetched per wait.
const EVENTS_CAPACITY: usize = 1024;

/// A descriptor reported ready by the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    Listener,
    Client {
        slot: SlotId,
        readable: bool,
        writable: bool,
    },
}

/// Wrapper around the OS readiness primitive and its watched set.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
}

impl Multiplexer {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    /// Block until at least one watched descriptor is ready.
    ///
    /// `None` waits indefinitely. An interrupted wait is retried; any other
    /// OS error is returned and is fatal to the loop.
    pub fn wait_for_ready(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(self
            .events
            .iter()
            .map(|event| match event.token() {
                LISTENER_TOKEN => Ready::Listener,
                Token(index) => Ready::Client {
                    slot: SlotId::new(index),
                    // Hangups and errors surface through the next read
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable(),
                },
            })
            .collect())
    }

    fn watch_listener(&self, listener: &mut TcpListener) -> io::Result<()> {
        self.poll
            .registry()
            .register(listener, LISTENER_TOKEN, Interest::READABLE)
    }

    fn watch(&self, stream: &mut TcpStream, slot: SlotId) -> io::Result<()> {
        self.poll
            .registry()
            .register(stream, Token(slot.index()), Interest::READABLE)
    }

    fn rewatch(&self, stream: &mut TcpStream, slot: SlotId, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(stream, Token(slot.index()), interest)
    }

    fn unwatch(&self, stream: &mut TcpStream) -> io::Result<()> {
        self.poll.registry().deregister(stream)
    }
}

/// Result of a listener readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Admitted(SlotId),
    /// Table at capacity; the socket was closed.
    Rejected(SocketAddr),
}

/// Result of a client readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Socket drained; session stays open.
    Open,
    /// Read budget spent with data possibly left; serve again soon.
    Yielded,
    /// Session torn down.
    Closed(CloseReason),
    /// No session in that slot (stale event).
    Vacant,
}

/// Outcome of queueing one frame for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Complete,
    Queued,
    Overflow,
}

/// Per-session connection state for the mio backend.
struct MioConnection {
    stream: TcpStream,
    lines: LineBuffer,
    /// Bytes accepted for delivery but not yet written
    outbound: BytesMut,
}

impl MioConnection {
    fn new(stream: TcpStream, max_line_length: usize) -> Self {
        Self {
            stream,
            lines: LineBuffer::new(max_line_length),
            outbound: BytesMut::new(),
        }
    }

    /// Write a frame now, queueing whatever the socket will not take.
    fn send(&mut self, frame: &[u8], limit: usize) -> io::Result<Delivery> {
        if !self.outbound.is_empty() {
            if self.outbound.len() + frame.len() > limit {
                return Ok(Delivery::Overflow);
            }
            self.outbound.extend_from_slice(frame);
            return Ok(Delivery::Queued);
        }

        let mut written = 0;
        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let rest = &frame[written..];
        if rest.is_empty() {
            Ok(Delivery::Complete)
        } else if rest.len() > limit {
            Ok(Delivery::Overflow)
        } else {
            self.outbound.extend_from_slice(rest);
            Ok(Delivery::Queued)
        }
    }

    /// Drain queued output. Returns true once nothing is left.
    fn flush(&mut self) -> io::Result<bool> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// The single-threaded relay: listener, multiplexer, and hub.
pub struct RelayLoop {
    listener: TcpListener,
    mux: Multiplexer,
    hub: Hub<MioConnection>,
    /// Slots that spent their read budget
    backlog: VecDeque<SlotId>,
    scratch: Vec<u8>,
    settings: RelaySettings,
}

impl RelayLoop {
    /// Bind the listener and set up an empty hub.
    pub fn bind(config: &Config) -> RelayResult<Self> {
        let addr = config.listen_addr()?;
        let listener = bind_listener(addr, config.backlog)
            .map_err(|source| RelayError::Bind { addr, source })?;
        let mut listener = TcpListener::from_std(listener);

        let mux = Multiplexer::new(EVENTS_CAPACITY)?;
        mux.watch_listener(&mut listener)?;

        Ok(Self {
            listener,
            mux,
            hub: Hub::new(config.max_connections),
            backlog: VecDeque::new(),
            scratch: vec![0u8; config.relay.read_chunk_size],
            settings: config.relay,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the wait primitive fails.
    pub fn run(&mut self) -> RelayResult<()> {
        loop {
            self.turn(None)?;
        }
    }

    /// One dispatch cycle: wait, then route every ready descriptor.
    ///
    /// Returns the number of descriptors served.
    pub fn turn(&mut self, timeout: Option<Duration>) -> RelayResult<usize> {
        let timeout = if self.backlog.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        let ready = self
            .mux
            .wait_for_ready(timeout)
            .map_err(RelayError::Wait)?;
        let mut backlogged: Vec<SlotId> = self.backlog.drain(..).collect();
        let mut served = 0;

        for event in ready {
            served += 1;
            match event {
                Ready::Listener => self.accept_pending(),
                Ready::Client {
                    slot,
                    readable,
                    writable,
                } => {
                    if writable {
                        self.on_client_writable(slot);
                    }
                    if readable {
                        backlogged.retain(|&s| s != slot);
                        self.dispatch_read(slot);
                    }
                }
            }
        }

        for slot in backlogged {
            served += 1;
            self.dispatch_read(slot);
        }

        Ok(served)
    }

    /// Accept until the listener would block.
    fn accept_pending(&mut self) {
        loop {
            match self.on_listener_ready() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "Accept aborted, continuing");
                }
                Err(e) => {
                    // fd exhaustion and the like; retried on the next listener event
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn dispatch_read(&mut self, slot: SlotId) {
        if self.on_client_ready(slot) == RelayOutcome::Yielded {
            self.backlog.push_back(slot);
        }
    }

    /// Accept one pending connection and admit it, or reject it at capacity.
    ///
    /// Returns `Ok(None)` when no connection is pending.
    pub fn on_listener_ready(&mut self) -> io::Result<Option<AcceptOutcome>> {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        };

        info!(peer = %peer, "Remote address: {}", peer);

        let conn = MioConnection::new(stream, self.settings.max_line_length);
        let slot = match self.hub.admit(conn, peer) {
            Ok(slot) => slot,
            Err(rejected) => {
                warn!(
                    peer = %peer,
                    capacity = self.hub.capacity(),
                    "Too many clients, rejecting connection"
                );
                // Dropping the stream closes it
                drop(rejected.into_inner());
                return Ok(Some(AcceptOutcome::Rejected(peer)));
            }
        };

        let watched = match self.hub.connection_mut(slot) {
            Some(conn) => self.mux.watch(&mut conn.stream, slot),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "connection not found")),
        };
        if let Err(e) = watched {
            self.hub.release(slot);
            return Err(e);
        }

        self.hub.mark_connected(slot);
        debug!(slot = %slot, peer = %peer, sessions = self.hub.len(), "Accepted connection");
        Ok(Some(AcceptOutcome::Admitted(slot)))
    }

    /// Read what the client sent, then quit, ignore, or broadcast each line.
    pub fn on_client_ready(&mut self, slot: SlotId) -> RelayOutcome {
        let mut budget = self.settings.read_budget;

        loop {
            let conn = match self.hub.connection_mut(slot) {
                Some(conn) => conn,
                None => return RelayOutcome::Vacant,
            };

            let n = match conn.stream.read(&mut self.scratch) {
                Ok(0) => return self.teardown(slot, CloseReason::PeerClosed),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return RelayOutcome::Open,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(slot = %slot, error = %e, "Read error");
                    return self.teardown(slot, CloseReason::ReadError);
                }
            };
            conn.lines.extend(&self.scratch[..n]);

            while let Some(command) = self.next_command(slot) {
                match command {
                    Command::Quit => return self.teardown(slot, CloseReason::Quit),
                    Command::NoOp => trace!(slot = %slot, "No-op"),
                    Command::Broadcast(payload) => self.broadcast(slot, &payload),
                }
            }

            budget = budget.saturating_sub(n);
            if budget == 0 {
                trace!(slot = %slot, "Read budget spent, yielding");
                return RelayOutcome::Yielded;
            }
        }
    }

    fn next_command(&mut self, slot: SlotId) -> Option<Command> {
        self.hub.connection_mut(slot)?.lines.next_command()
    }

    /// Deliver one line from `sender` to every other session.
    fn broadcast(&mut self, sender: SlotId, payload: &[u8]) {
        let Some(frame) = self.hub.frame(sender, payload) else {
            return;
        };

        let mut failed = Vec::new();
        for peer in self.hub.peer_slots(sender) {
            let Some(conn) = self.hub.connection_mut(peer) else {
                continue;
            };
            match conn.send(&frame, self.settings.max_pending_output) {
                Ok(Delivery::Complete) => {}
                Ok(Delivery::Queued) => {
                    let interest = Interest::READABLE | Interest::WRITABLE;
                    if let Err(e) = self.mux.rewatch(&mut conn.stream, peer, interest) {
                        warn!(slot = %peer, error = %e, "Failed to watch for writability");
                        failed.push((peer, CloseReason::WriteError));
                    }
                }
                Ok(Delivery::Overflow) => {
                    warn!(slot = %peer, "Outbound queue full, dropping peer");
                    failed.push((peer, CloseReason::Overflow));
                }
                Err(e) => {
                    warn!(slot = %peer, error = %e, "Delivery failed, dropping peer");
                    failed.push((peer, CloseReason::WriteError));
                }
            }
        }

        for (peer, reason) in failed {
            self.teardown(peer, reason);
        }
    }

    /// Flush queued output once the socket accepts writes again.
    fn on_client_writable(&mut self, slot: SlotId) {
        let Some(conn) = self.hub.connection_mut(slot) else {
            return;
        };
        match conn.flush() {
            Ok(false) => {}
            Ok(true) => {
                if let Err(e) = self.mux.rewatch(&mut conn.stream, slot, Interest::READABLE) {
                    debug!(slot = %slot, error = %e, "Failed to reregister");
                    self.teardown(slot, CloseReason::WriteError);
                }
            }
            Err(e) => {
                debug!(slot = %slot, error = %e, "Write error");
                self.teardown(slot, CloseReason::WriteError);
            }
        }
    }

    /// Release the slot and session, stop watching, and close the socket.
    fn teardown(&mut self, slot: SlotId, reason: CloseReason) -> RelayOutcome {
        self.backlog.retain(|&s| s != slot);

        if let Some((mut conn, session)) = self.hub.release(slot) {
            if let Err(e) = self.mux.unwatch(&mut conn.stream) {
                debug!(slot = %slot, error = %e, "Failed to deregister");
            }
            log_release(&session, reason);
        }

        debug_assert!(self.hub.is_consistent());
        RelayOutcome::Closed(reason)
    }
}

/// Accept errors that concern only the one connection being accepted.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Run the relay on the calling thread.
pub fn run(config: Config) -> RelayResult<()> {
    let mut relay = RelayLoop::bind(&config)?;

    info!(
        addr = %relay.local_addr()?,
        max_connections = config.max_connections,
        read_budget = config.relay.read_budget,
        "Starting mio runtime"
    );

    relay.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, SockRef, Socket, Type};
    use std::net::TcpStream as StdStream;

    fn test_config(max_connections: usize) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections,
            ..Config::default()
        }
    }

    struct Harness {
        relay: RelayLoop,
        addr: SocketAddr,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let relay = RelayLoop::bind(&config).unwrap();
            let addr = relay.local_addr().unwrap();
            Self { relay, addr }
        }

        /// Run dispatch cycles until the loop goes idle.
        fn pump(&mut self) {
            let mut idle = 0;
            while idle < 2 {
                let served = self.relay.turn(Some(Duration::from_millis(30))).unwrap();
                if served == 0 {
                    idle += 1;
                } else {
                    idle = 0;
                }
            }
        }

        fn connect(&mut self) -> StdStream {
            let stream = StdStream::connect(self.addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            self.pump();
            stream
        }

        fn slot_of(&self, client: &StdStream) -> SlotId {
            let local = client.local_addr().unwrap().to_string();
            self.relay
                .hub
                .sessions()
                .find(|session| session.remote_address() == local)
                .map(|session| session.slot())
                .expect("client has a session")
        }
    }

    /// Connect with a small receive buffer so the relay's writes back up fast.
    fn connect_small_buffer(h: &mut Harness) -> StdStream {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        socket.connect(&h.addr.into()).unwrap();
        let stream: StdStream = socket.into();
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        h.pump();

        let slot = h.slot_of(&stream);
        let conn = h.relay.hub.connection(slot).unwrap();
        SockRef::from(&conn.stream).set_send_buffer_size(4096).unwrap();
        stream
    }

    fn big_line(i: usize) -> String {
        format!("{:04}{}\n", i, "x".repeat(3995))
    }

    fn send(client: &mut StdStream, data: &[u8]) {
        client.write_all(data).unwrap();
    }

    fn recv_exact(client: &mut StdStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        client.read_exact(&mut buf).unwrap();
        buf
    }

    fn expected(from: &StdStream, line: &str) -> Vec<u8> {
        format!("{}: {}", from.local_addr().unwrap(), line).into_bytes()
    }

    fn assert_silent(client: &mut StdStream) {
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0u8; 64];
        match client.read(&mut buf) {
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            other => panic!("expected no data, got {:?}", other),
        }
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
    }

    fn assert_closed(client: &mut StdStream) {
        let mut buf = [0u8; 64];
        match client.read(&mut buf) {
            Ok(0) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
            other => panic!("expected closed socket, got {:?}", other),
        }
    }

    #[test]
    fn test_distinct_slots_for_concurrent_clients() {
        let mut h = Harness::new(test_config(8));
        let clients: Vec<_> = (0..5).map(|_| h.connect()).collect();

        let mut slots: Vec<_> = clients.iter().map(|c| h.slot_of(c)).collect();
        slots.sort();
        slots.dedup();
        assert_eq!(slots.len(), 5);
        assert_eq!(h.relay.hub.len(), 5);
        assert!(h.relay.hub.is_consistent());
    }

    #[test]
    fn test_broadcast_reaches_every_other_peer() {
        let mut h = Harness::new(test_config(8));
        let mut a = h.connect();
        let mut b = h.connect();
        let mut c = h.connect();

        send(&mut a, b"hello\n");
        h.pump();

        let frame = expected(&a, "hello\n");
        assert_eq!(recv_exact(&mut b, frame.len()), frame);
        assert_eq!(recv_exact(&mut c, frame.len()), frame);
        assert_silent(&mut a);
        assert_silent(&mut b);
    }

    #[test]
    fn test_quit_closes_sender_and_frees_slot() {
        let mut h = Harness::new(test_config(8));
        let mut a = h.connect();
        let mut b = h.connect();
        let slot_a = h.slot_of(&a);

        send(&mut a, b"-q\n");
        h.pump();

        assert_closed(&mut a);
        assert_silent(&mut b);
        assert!(!h.relay.hub.contains(slot_a));
        assert_eq!(h.relay.hub.len(), 1);
        assert!(h.relay.hub.is_consistent());

        // The next accepted connection takes the freed slot
        let d = h.connect();
        assert_eq!(h.slot_of(&d), slot_a);
    }

    #[test]
    fn test_noop_changes_nothing() {
        let mut h = Harness::new(test_config(8));
        let mut a = h.connect();
        let mut b = h.connect();
        let slot_a = h.slot_of(&a);

        send(&mut a, b"-s\n");
        h.pump();

        assert_silent(&mut b);
        assert_eq!(h.relay.hub.len(), 2);
        assert!(h.relay.hub.contains(slot_a));

        // Still relaying afterwards
        send(&mut a, b"after\n");
        h.pump();
        let frame = expected(&a, "after\n");
        assert_eq!(recv_exact(&mut b, frame.len()), frame);
    }

    #[test]
    fn test_rejects_at_capacity_without_disturbing_sessions() {
        let mut h = Harness::new(test_config(2));
        let mut a = h.connect();
        let mut b = h.connect();
        let mut c = h.connect();

        assert_closed(&mut c);
        assert_eq!(h.relay.hub.len(), 2);

        send(&mut a, b"still here\n");
        h.pump();
        let frame = expected(&a, "still here\n");
        assert_eq!(recv_exact(&mut b, frame.len()), frame);
    }

    #[test]
    fn test_abrupt_disconnect_matches_quit() {
        let mut h = Harness::new(test_config(8));
        let a = h.connect();
        let mut b = h.connect();
        let slot_a = h.slot_of(&a);

        drop(a);
        h.pump();

        assert!(!h.relay.hub.contains(slot_a));
        assert!(h.relay.hub.session(slot_a).is_none());
        assert_eq!(h.relay.hub.len(), 1);
        assert!(h.relay.hub.is_consistent());
        assert_silent(&mut b);
    }

    #[test]
    fn test_partial_line_is_reassembled() {
        let mut h = Harness::new(test_config(8));
        let mut a = h.connect();
        let mut b = h.connect();

        send(&mut a, b"hel");
        h.pump();
        assert_silent(&mut b);

        send(&mut a, b"lo\n");
        h.pump();
        let frame = expected(&a, "hello\n");
        assert_eq!(recv_exact(&mut b, frame.len()), frame);
    }

    #[test]
    fn test_messages_from_many_senders_arrive_in_order() {
        let mut h = Harness::new(test_config(8));
        let mut clients: Vec<_> = (0..4).map(|_| h.connect()).collect();

        for i in 0..clients.len() {
            send(&mut clients[i], format!("message {i}\n").as_bytes());
            h.pump();
        }

        for receiver in 0..clients.len() {
            let mut want = Vec::new();
            for sender in 0..clients.len() {
                if sender != receiver {
                    want.extend(expected(&clients[sender], &format!("message {sender}\n")));
                }
            }
            let got = recv_exact(&mut clients[receiver], want.len());
            assert_eq!(got, want);
            assert_silent(&mut clients[receiver]);
        }
    }

    #[test]
    fn test_small_read_budget_still_delivers_everything() {
        let mut config = test_config(8);
        config.relay.read_chunk_size = 4;
        config.relay.read_budget = 8;
        let mut h = Harness::new(config);
        let mut a = h.connect();
        let mut b = h.connect();

        let mut burst = Vec::new();
        for i in 0..20 {
            burst.extend(format!("line {i}\n").into_bytes());
        }
        send(&mut a, &burst);
        h.pump();

        let mut want = Vec::new();
        for i in 0..20 {
            want.extend(expected(&a, &format!("line {i}\n")));
        }
        assert_eq!(recv_exact(&mut b, want.len()), want);
        assert!(h.relay.backlog.is_empty());
    }

    #[test]
    fn test_bytes_after_quit_are_discarded() {
        let mut h = Harness::new(test_config(8));
        let mut a = h.connect();
        let mut b = h.connect();

        send(&mut a, b"-q\nignored\n");
        h.pump();

        assert_closed(&mut a);
        assert_silent(&mut b);
    }

    #[test]
    fn test_stalled_peer_is_dropped_without_disturbing_others() {
        let mut config = test_config(8);
        config.relay.read_chunk_size = 4096;
        config.relay.max_pending_output = 8192;
        let mut h = Harness::new(config);
        let mut a = h.connect();
        let mut b = h.connect();
        let stalled = connect_small_buffer(&mut h);
        let slot_stalled = h.slot_of(&stalled);

        let mut saw_queued = false;
        let mut sent = 0;
        while h.relay.hub.contains(slot_stalled) {
            assert!(sent < 500, "stalled peer never dropped");
            let line = big_line(sent);
            send(&mut a, line.as_bytes());
            h.pump();

            let frame = expected(&a, &line);
            assert_eq!(recv_exact(&mut b, frame.len()), frame);
            saw_queued |= h
                .relay
                .hub
                .connection(slot_stalled)
                .is_some_and(|conn| !conn.outbound.is_empty());
            sent += 1;
        }

        assert!(saw_queued);
        assert_eq!(h.relay.hub.len(), 2);
        assert!(h.relay.hub.is_consistent());

        // Sender and the draining peer keep relaying
        send(&mut b, b"still there\n");
        h.pump();
        let frame = expected(&b, "still there\n");
        assert_eq!(recv_exact(&mut a, frame.len()), frame);

        send(&mut a, b"and here\n");
        h.pump();
        let frame = expected(&a, "and here\n");
        assert_eq!(recv_exact(&mut b, frame.len()), frame);
    }

    #[test]
    fn test_slow_peer_catches_up_from_queue() {
        let mut config = test_config(8);
        config.relay.read_chunk_size = 4096;
        config.relay.max_pending_output = 1 << 20;
        let mut h = Harness::new(config);
        let mut a = h.connect();
        let mut slow = connect_small_buffer(&mut h);
        let slot_slow = h.slot_of(&slow);

        let mut want = Vec::new();
        let mut sent = 0;
        while h
            .relay
            .hub
            .connection(slot_slow)
            .is_some_and(|conn| conn.outbound.is_empty())
        {
            assert!(sent < 500, "output never queued");
            let line = big_line(sent);
            send(&mut a, line.as_bytes());
            h.pump();
            want.extend(expected(&a, &line));
            sent += 1;
        }

        // Read while the loop flushes the queue on writability
        slow.set_nonblocking(true).unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; 8192];
        for _ in 0..500 {
            if got.len() >= want.len() {
                break;
            }
            h.relay.turn(Some(Duration::from_millis(10))).unwrap();
            loop {
                match slow.read(&mut buf) {
                    Ok(0) => panic!("slow peer closed"),
                    Ok(n) => got.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("read failed: {e}"),
                }
            }
        }

        assert_eq!(got, want);
        let conn = h.relay.hub.connection(slot_slow).unwrap();
        assert!(conn.outbound.is_empty());
        assert!(h.relay.hub.is_consistent());
    }

    #[test]
    fn test_transient_accept_errors() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert!(is_transient_accept_error(&aborted));
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::Interrupted)));

        // EMFILE
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(24)));
    }
}
