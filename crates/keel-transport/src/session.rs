//! # Connection Lifecycle
//!
//! Handshake, liveness, and teardown. Pure logic: managers never touch the
//! socket, they push [`SessionEvent`]s describing frames to send and
//! lifecycle transitions for the dispatcher to act on.
//!
//! Client state machine:
//!
//! ```text
//!   Idle ──Connect──▶ Connecting ──Connect reply──▶ Connected ──Disconnect──▶ Idle
//!                         │
//!                    ServerFull ──▶ Refused
//! ```
//!
//! The server keeps one liveness record per endpoint. Any datagram from a
//! known endpoint counts as a keepalive.

use quanta::Instant;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::wire::FrameKind;

// ─── Events ──────────────────────────────────────────────────────────────────

/// Output of a lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Send a 4-byte control frame of `kind` to `peer`.
    Send { peer: SocketAddr, kind: FrameKind },
    /// Per-endpoint state must be created.
    Connected(SocketAddr),
    /// Per-endpoint state must be torn down.
    Disconnected(SocketAddr),
    /// Nothing was heard from `peer` within the connection timeout.
    TimedOut(SocketAddr),
}

/// Capability set shared by both lifecycle managers.
pub trait ConnectionManager {
    /// Observe an inbound datagram. Called for every datagram, before it is
    /// routed anywhere else.
    fn handle_packet(
        &mut self,
        from: SocketAddr,
        kind: FrameKind,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()>;

    /// Liveness sweep.
    fn check_timeout(&mut self, now: Instant, events: &mut Vec<SessionEvent>);

    fn is_connected(&self, peer: &SocketAddr) -> bool;

    /// Locally initiated teardown. Returns `false` if `peer` was not connected.
    fn disconnect(&mut self, peer: SocketAddr, events: &mut Vec<SessionEvent>) -> bool;
}

// ─── Client ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    /// Connect sent, waiting for approval.
    Connecting,
    Connected,
    /// The server answered with ServerFull.
    Refused,
}

pub struct ClientSession {
    state: ClientState,
    server: Option<SocketAddr>,
    last_receipt: Option<Instant>,
    timeout: Duration,
}

impl ClientSession {
    pub fn new(timeout: Duration) -> Self {
        ClientSession {
            state: ClientState::Idle,
            server: None,
            last_receipt: None,
            timeout,
        }
    }

    /// Start the handshake with `server`.
    pub fn connect(&mut self, server: SocketAddr, now: Instant, events: &mut Vec<SessionEvent>) {
        self.server = Some(server);
        self.state = ClientState::Connecting;
        self.last_receipt = Some(now);
        events.push(SessionEvent::Send {
            peer: server,
            kind: FrameKind::Connect,
        });
        debug!(server = %server, "connecting");
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    pub fn connected(&self) -> bool {
        self.state == ClientState::Connected
    }
}

impl ConnectionManager for ClientSession {
    fn handle_packet(
        &mut self,
        from: SocketAddr,
        kind: FrameKind,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        if self.server != Some(from) {
            return Ok(());
        }
        self.last_receipt = Some(now);

        match kind {
            FrameKind::ServerFull => {
                // A connected client can still be told the server is full
                // when it repeats its handshake; it stays connected.
                if self.state != ClientState::Connected {
                    self.state = ClientState::Refused;
                }
                warn!(server = %from, "connection refused: server at capacity");
                Err(Error::ServerAtCapacity(from))
            }
            FrameKind::Disconnect => {
                if self.state == ClientState::Connected {
                    self.state = ClientState::Idle;
                    debug!(server = %from, "disconnected by server");
                    events.push(SessionEvent::Disconnected(from));
                }
                Ok(())
            }
            FrameKind::Connect => {
                if self.state == ClientState::Connecting {
                    self.state = ClientState::Connected;
                    debug!(server = %from, "connected");
                    events.push(SessionEvent::Connected(from));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Reports one timeout per sweep for as long as the server stays silent.
    fn check_timeout(&mut self, now: Instant, events: &mut Vec<SessionEvent>) {
        if !matches!(self.state, ClientState::Connecting | ClientState::Connected) {
            return;
        }
        let (Some(server), Some(last)) = (self.server, self.last_receipt) else {
            return;
        };
        if now.saturating_duration_since(last) < self.timeout {
            return;
        }
        debug!(server = %server, timeout_ms = self.timeout.as_millis() as u64, "connection timed out");
        events.push(SessionEvent::TimedOut(server));
    }

    fn is_connected(&self, peer: &SocketAddr) -> bool {
        self.connected() && self.server.as_ref() == Some(peer)
    }

    fn disconnect(&mut self, peer: SocketAddr, events: &mut Vec<SessionEvent>) -> bool {
        if !self.is_connected(&peer) {
            return false;
        }
        self.state = ClientState::Idle;
        events.push(SessionEvent::Send {
            peer,
            kind: FrameKind::Disconnect,
        });
        events.push(SessionEvent::Disconnected(peer));
        debug!(server = %peer, "disconnected");
        true
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub struct ServerSessions {
    /// endpoint → last receipt time.
    peers: HashMap<SocketAddr, Instant>,
    max_connections: usize,
    timeout: Duration,
    /// Scratch list reused by the timeout sweep.
    expired: Vec<SocketAddr>,
}

impl ServerSessions {
    pub fn new(max_connections: usize, timeout: Duration) -> Self {
        ServerSessions {
            peers: HashMap::with_capacity(max_connections),
            max_connections,
            timeout,
            expired: Vec::new(),
        }
    }

    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }

    fn on_connect(&mut self, from: SocketAddr, now: Instant, events: &mut Vec<SessionEvent>) {
        let at_capacity = self.peers.len() >= self.max_connections;
        if at_capacity {
            warn!(peer = %from, max = self.max_connections, "server at capacity");
            events.push(SessionEvent::Send {
                peer: from,
                kind: FrameKind::ServerFull,
            });
        }

        // Known endpoints are re-approved even at capacity.
        if let Some(last) = self.peers.get_mut(&from) {
            *last = now;
            events.push(SessionEvent::Send {
                peer: from,
                kind: FrameKind::Connect,
            });
            return;
        }
        if at_capacity {
            return;
        }

        self.peers.insert(from, now);
        events.push(SessionEvent::Send {
            peer: from,
            kind: FrameKind::Connect,
        });
        events.push(SessionEvent::Connected(from));
        debug!(peer = %from, connections = self.peers.len(), "peer connected");
    }
}

impl ConnectionManager for ServerSessions {
    fn handle_packet(
        &mut self,
        from: SocketAddr,
        kind: FrameKind,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        match kind {
            FrameKind::Connect => self.on_connect(from, now, events),
            FrameKind::Disconnect => {
                if self.peers.remove(&from).is_some() {
                    debug!(peer = %from, "peer disconnected");
                    events.push(SessionEvent::Disconnected(from));
                }
            }
            _ => {
                if let Some(last) = self.peers.get_mut(&from) {
                    *last = now;
                }
            }
        }
        Ok(())
    }

    fn check_timeout(&mut self, now: Instant, events: &mut Vec<SessionEvent>) {
        let timeout = self.timeout;
        self.expired.clear();
        self.expired.extend(
            self.peers
                .iter()
                .filter(|(_, last)| now.saturating_duration_since(**last) > timeout)
                .map(|(peer, _)| *peer),
        );

        for peer in self.expired.drain(..) {
            self.peers.remove(&peer);
            debug!(peer = %peer, timeout_ms = timeout.as_millis() as u64, "peer timed out");
            events.push(SessionEvent::Send {
                peer,
                kind: FrameKind::Disconnect,
            });
            events.push(SessionEvent::TimedOut(peer));
            events.push(SessionEvent::Disconnected(peer));
        }
    }

    fn is_connected(&self, peer: &SocketAddr) -> bool {
        self.peers.contains_key(peer)
    }

    fn disconnect(&mut self, peer: SocketAddr, events: &mut Vec<SessionEvent>) -> bool {
        if self.peers.remove(&peer).is_none() {
            return false;
        }
        events.push(SessionEvent::Send {
            peer,
            kind: FrameKind::Disconnect,
        });
        events.push(SessionEvent::Disconnected(peer));
        debug!(peer = %peer, "peer kicked");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quanta::Clock;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn send(peer: SocketAddr, kind: FrameKind) -> SessionEvent {
        SessionEvent::Send { peer, kind }
    }

    #[test]
    fn client_handshake_flow() {
        let (clock, _mock) = Clock::mock();
        let mut client = ClientSession::new(TIMEOUT);
        let mut events = Vec::new();

        client.connect(addr(1), clock.now(), &mut events);
        assert_eq!(events, vec![send(addr(1), FrameKind::Connect)]);
        assert_eq!(client.state(), ClientState::Connecting);

        events.clear();
        client
            .handle_packet(addr(1), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();
        assert_eq!(events, vec![SessionEvent::Connected(addr(1))]);
        assert!(client.connected());

        // A second approval is ignored.
        events.clear();
        client
            .handle_packet(addr(1), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn client_ignores_other_senders() {
        let (clock, _mock) = Clock::mock();
        let mut client = ClientSession::new(TIMEOUT);
        let mut events = Vec::new();
        client.connect(addr(1), clock.now(), &mut events);
        events.clear();

        client
            .handle_packet(addr(2), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(client.state(), ClientState::Connecting);
    }

    #[test]
    fn client_server_full_is_terminal() {
        let (clock, _mock) = Clock::mock();
        let mut client = ClientSession::new(TIMEOUT);
        let mut events = Vec::new();
        client.connect(addr(1), clock.now(), &mut events);

        let err = client
            .handle_packet(addr(1), FrameKind::ServerFull, clock.now(), &mut events)
            .unwrap_err();
        assert!(matches!(err, Error::ServerAtCapacity(a) if a == addr(1)));
        assert_eq!(client.state(), ClientState::Refused);
    }

    #[test]
    fn client_disconnected_by_server() {
        let (clock, _mock) = Clock::mock();
        let mut client = ClientSession::new(TIMEOUT);
        let mut events = Vec::new();
        client.connect(addr(1), clock.now(), &mut events);
        client
            .handle_packet(addr(1), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();

        events.clear();
        client
            .handle_packet(addr(1), FrameKind::Disconnect, clock.now(), &mut events)
            .unwrap();
        assert_eq!(events, vec![SessionEvent::Disconnected(addr(1))]);
        assert!(!client.connected());
    }

    #[test]
    fn client_timeout_fires_once_per_sweep_while_silent() {
        let (clock, mock) = Clock::mock();
        let mut client = ClientSession::new(TIMEOUT);
        let mut events = Vec::new();
        client.connect(addr(1), clock.now(), &mut events);
        events.clear();

        mock.increment(Duration::from_secs(9));
        client.check_timeout(clock.now(), &mut events);
        assert!(events.is_empty());

        // Every sweep past the timeout reports exactly one event.
        let mut per_sweep = Vec::new();
        for _ in 0..3 {
            mock.increment(Duration::from_secs(11));
            let before = events.len();
            client.check_timeout(clock.now(), &mut events);
            per_sweep.push(events.len() - before);
        }
        assert_eq!(per_sweep, vec![1, 1, 1]);
        assert!(events.iter().all(|e| *e == SessionEvent::TimedOut(addr(1))));

        // Traffic resets the silence window.
        events.clear();
        client
            .handle_packet(addr(1), FrameKind::Ping, clock.now(), &mut events)
            .unwrap();
        mock.increment(Duration::from_secs(9));
        client.check_timeout(clock.now(), &mut events);
        assert!(events.is_empty());
        mock.increment(Duration::from_secs(1));
        client.check_timeout(clock.now(), &mut events);
        assert_eq!(events, vec![SessionEvent::TimedOut(addr(1))]);
    }

    #[test]
    fn client_disconnect_notifies_server() {
        let (clock, _mock) = Clock::mock();
        let mut client = ClientSession::new(TIMEOUT);
        let mut events = Vec::new();
        assert!(!client.disconnect(addr(1), &mut events));

        client.connect(addr(1), clock.now(), &mut events);
        client
            .handle_packet(addr(1), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();
        events.clear();
        assert!(client.disconnect(addr(1), &mut events));
        assert_eq!(
            events,
            vec![
                send(addr(1), FrameKind::Disconnect),
                SessionEvent::Disconnected(addr(1))
            ]
        );
    }

    #[test]
    fn server_registers_once() {
        let (clock, _mock) = Clock::mock();
        let mut server = ServerSessions::new(4, TIMEOUT);
        let mut events = Vec::new();

        server
            .handle_packet(addr(1), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();
        assert_eq!(
            events,
            vec![
                send(addr(1), FrameKind::Connect),
                SessionEvent::Connected(addr(1))
            ]
        );

        events.clear();
        server
            .handle_packet(addr(1), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();
        assert_eq!(events, vec![send(addr(1), FrameKind::Connect)]);
        assert_eq!(server.connected_peers().len(), 1);
    }

    #[test]
    fn server_full_rejects_new_but_reapproves_known() {
        let (clock, _mock) = Clock::mock();
        let mut server = ServerSessions::new(1, TIMEOUT);
        let mut events = Vec::new();
        server
            .handle_packet(addr(1), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();

        events.clear();
        server
            .handle_packet(addr(2), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();
        assert_eq!(events, vec![send(addr(2), FrameKind::ServerFull)]);
        assert!(!server.is_connected(&addr(2)));

        events.clear();
        server
            .handle_packet(addr(1), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();
        assert_eq!(
            events,
            vec![
                send(addr(1), FrameKind::ServerFull),
                send(addr(1), FrameKind::Connect)
            ]
        );
    }

    #[test]
    fn server_disconnect_of_unknown_is_noop() {
        let (clock, _mock) = Clock::mock();
        let mut server = ServerSessions::new(4, TIMEOUT);
        let mut events = Vec::new();
        server
            .handle_packet(addr(9), FrameKind::Disconnect, clock.now(), &mut events)
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn server_sweep_expires_silent_peers() {
        let (clock, mock) = Clock::mock();
        let mut server = ServerSessions::new(4, TIMEOUT);
        let mut events = Vec::new();
        server
            .handle_packet(addr(1), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();
        server
            .handle_packet(addr(2), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();

        mock.increment(Duration::from_secs(6));
        // Traffic from addr(2) keeps it alive.
        server
            .handle_packet(addr(2), FrameKind::Reliable, clock.now(), &mut events)
            .unwrap();
        mock.increment(Duration::from_secs(5));

        events.clear();
        server.check_timeout(clock.now(), &mut events);
        assert_eq!(
            events,
            vec![
                send(addr(1), FrameKind::Disconnect),
                SessionEvent::TimedOut(addr(1)),
                SessionEvent::Disconnected(addr(1)),
            ]
        );
        assert_eq!(server.connected_peers(), vec![addr(2)]);

        events.clear();
        server.check_timeout(clock.now(), &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn server_kick() {
        let (clock, _mock) = Clock::mock();
        let mut server = ServerSessions::new(4, TIMEOUT);
        let mut events = Vec::new();
        server
            .handle_packet(addr(1), FrameKind::Connect, clock.now(), &mut events)
            .unwrap();
        events.clear();
        assert!(server.disconnect(addr(1), &mut events));
        assert!(!server.disconnect(addr(1), &mut events));
        assert!(server.connected_peers().is_empty());
        assert_eq!(events.last(), Some(&SessionEvent::Disconnected(addr(1))));
    }
}
