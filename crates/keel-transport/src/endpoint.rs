//! # Dispatcher
//!
//! [`Endpoint`] owns a [`DatagramTransport`], a lifecycle manager, and the
//! per-peer protocol state. Nothing runs in the background: every
//! [`poll`](Endpoint::poll) drains the transport, routes each datagram by its
//! frame kind, then runs the periodic tick (pings, timeout sweep,
//! retransmission sweep). All timing is therefore quantized to the caller's
//! poll cadence.
//!
//! Application events are pushed onto a `crossbeam_channel` from inside the
//! `poll`/`send` call that caused them. Drain [`Endpoint::events`] after each
//! poll.
//!
//! [`Client`] and [`Server`] are thin facades over an `Endpoint` with the
//! matching lifecycle manager.

use crossbeam_channel::{unbounded, Receiver, Sender};
use quanta::{Clock, Instant};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::peers::PeerTable;
use crate::ping::{pong_for, PingState};
use crate::pool::{BufferPool, PooledBuf};
use crate::receiver::{IncomingHandler, SliceOutcome};
use crate::sender::{check_reliable_size, AckOutcome, OutgoingHandler};
use crate::session::{ClientSession, ClientState, ConnectionManager, ServerSessions, SessionEvent};
use crate::stats::EndpointStats;
use crate::transport::{DatagramTransport, UdpTransport, SERVER_SOCKET_BUFFER};
use crate::unreliable::UnreliableChannel;
use crate::wire::{encode_frame, frame_payload, short_frame, FrameKind, Header, MTU};

// ─── Public types ────────────────────────────────────────────────────────────

/// Delivery guarantee requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendMode {
    /// Single datagram, no retransmission.
    Unreliable,
    /// Fragmented, acknowledged, retransmitted until acknowledged.
    Reliable,
}

/// Notification delivered to the application.
#[derive(Debug)]
pub enum Event {
    Connected(SocketAddr),
    Disconnected(SocketAddr),
    /// Nothing heard from the peer within the connection timeout. Not
    /// fatal on the client; the server follows it with `Disconnected`.
    ConnectionTimeout(SocketAddr),
    Received {
        peer: SocketAddr,
        mode: SendMode,
        payload: PooledBuf,
    },
}

/// Snapshot of a peer's outgoing reliable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableProgress {
    pub packet_id: u16,
    pub acknowledged_slices: u16,
    /// A message is sliced and awaiting acknowledgment.
    pub in_flight: bool,
    /// Messages waiting behind the in-flight one.
    pub queued: usize,
}

// ─── Peer state ──────────────────────────────────────────────────────────────

struct Peer {
    outgoing: OutgoingHandler,
    incoming: IncomingHandler,
    ping: PingState,
}

impl Peer {
    fn new(pool: &BufferPool, initial_ack_wait: Duration) -> Self {
        Peer {
            outgoing: OutgoingHandler::new(pool.clone(), initial_ack_wait),
            incoming: IncomingHandler::new(pool.clone()),
            ping: PingState::new(),
        }
    }
}

/// Transport plus the counters updated on every send, kept apart from the
/// peer table so both can be borrowed at once.
struct Link<T> {
    transport: T,
    stats: EndpointStats,
}

impl<T: DatagramTransport> Link<T> {
    fn send(&mut self, to: SocketAddr, datagram: &[u8]) -> Result<()> {
        if self.transport.try_send(to, datagram)? {
            self.stats.datagrams_sent += 1;
        } else {
            self.stats.send_drops += 1;
            trace!(peer = %to, len = datagram.len(), "send would block: datagram dropped");
        }
        Ok(())
    }
}

/// Emit the due part of a peer's in-flight reliable message.
fn flush_outgoing<T: DatagramTransport>(
    addr: SocketAddr,
    outgoing: &mut OutgoingHandler,
    link: &mut Link<T>,
    now: Instant,
) -> Result<()> {
    let frames = outgoing.packets_to_send(now);
    if frames.is_empty() {
        return Ok(());
    }
    let retransmission = outgoing.rounds() > 0;
    for frame in frames {
        link.send(addr, frame)?;
    }
    if retransmission {
        link.stats.retransmitted_slices += frames.len() as u64;
    }
    outgoing.mark_sent(now);
    Ok(())
}

// ─── Endpoint ────────────────────────────────────────────────────────────────

pub struct Endpoint<T, M> {
    link: Link<T>,
    manager: M,
    peers: PeerTable<Peer>,
    unreliable: UnreliableChannel,
    pool: BufferPool,
    clock: Clock,
    config: EndpointConfig,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    /// Scratch buffer for lifecycle manager output.
    session_events: Vec<SessionEvent>,
    /// Receive slot, taken out for the duration of a drain.
    recv_slot: Option<PooledBuf>,
}

impl<T: DatagramTransport, M: ConnectionManager> Endpoint<T, M> {
    pub fn new(transport: T, manager: M, config: EndpointConfig, clock: Clock) -> Self {
        let pool = BufferPool::new(config.pool_capacity);
        let (events_tx, events_rx) = unbounded();
        let recv_slot = Some(pool.rent(MTU));
        Endpoint {
            link: Link {
                transport,
                stats: EndpointStats::default(),
            },
            manager,
            peers: PeerTable::new(),
            unreliable: UnreliableChannel::new(),
            pool,
            clock,
            config,
            events_tx,
            events_rx,
            session_events: Vec::new(),
            recv_slot,
        }
    }

    /// Drain every pending datagram, then run the periodic tick.
    ///
    /// Framing defects (unknown flags, truncated header, foreign version)
    /// and a ServerFull reply surface as errors. A rejected datagram does
    /// not stop the drain or the tick; the first error of the pass is
    /// returned once both have run.
    pub fn poll(&mut self) -> Result<()> {
        let mut slot = self.recv_slot.take().unwrap_or_else(|| self.pool.rent(MTU));
        let drained = self.drain(&mut slot);
        self.recv_slot = Some(slot);

        let now = self.clock.now();
        let ticked = self.tick(now);
        drained.and(ticked)
    }

    fn drain(&mut self, slot: &mut PooledBuf) -> Result<()> {
        let mut first_error = None;
        while let Some((len, from)) = self.link.transport.try_receive(slot)? {
            self.link.stats.datagrams_received += 1;
            if let Err(e) = self.dispatch(from, &slot[..len]) {
                self.link.stats.rejected_datagrams += 1;
                debug!(peer = %from, len, error = %e, "datagram rejected");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn dispatch(&mut self, from: SocketAddr, datagram: &[u8]) -> Result<()> {
        let header = Header::decode(datagram, from)?;
        let now = self.clock.now();

        // Liveness first, for every datagram.
        let handled = self
            .manager
            .handle_packet(from, header.kind, now, &mut self.session_events);
        self.apply_session_events()?;
        handled?;

        if header.kind.is_control() {
            return Ok(());
        }

        let Some(slot) = self.peers.slot(&from) else {
            self.link.stats.unknown_peer_drops += 1;
            trace!(peer = %from, kind = ?header.kind, "datagram from unknown peer dropped");
            return Ok(());
        };
        let Some(peer) = self.peers.get_mut(slot) else {
            return Ok(());
        };

        match header.kind {
            FrameKind::Ping => {
                let pong = encode_frame(&self.pool, &pong_for(&header), &[]);
                self.link.send(from, &pong)?;
            }
            FrameKind::PingAck => {
                if let Some(rtt) = peer.ping.on_ping_ack(header.packet_id, now) {
                    trace!(peer = %from, rtt_us = rtt.as_micros() as u64, "rtt estimate updated");
                    peer.outgoing.on_rtt_updated(rtt);
                }
            }
            FrameKind::Unreliable => {
                let payload = UnreliableChannel::strip(&self.pool, datagram, &header);
                self.link.stats.messages_delivered += 1;
                let _ = self.events_tx.send(Event::Received {
                    peer: from,
                    mode: SendMode::Unreliable,
                    payload,
                });
            }
            FrameKind::Reliable => {
                match peer.incoming.on_slice(&header, frame_payload(datagram, &header)) {
                    SliceOutcome::Stale { ack } => {
                        self.link.stats.stale_slices += 1;
                        self.link.send(from, &encode_frame(&self.pool, &ack, &[]))?;
                    }
                    SliceOutcome::Duplicate => self.link.stats.duplicate_slices += 1,
                    SliceOutcome::Ignored => {}
                    SliceOutcome::Accepted { ack, delivered } => {
                        if let Some(ack) = ack {
                            self.link.send(from, &encode_frame(&self.pool, &ack, &[]))?;
                        }
                        if let Some(payload) = delivered {
                            self.link.stats.messages_delivered += 1;
                            let _ = self.events_tx.send(Event::Received {
                                peer: from,
                                mode: SendMode::Reliable,
                                payload,
                            });
                        }
                    }
                }
            }
            FrameKind::ReliableAck => {
                if let AckOutcome::Completed {
                    next_started: true, ..
                } = peer.outgoing.on_ack(header.packet_id, header.seq)
                {
                    flush_outgoing(from, &mut peer.outgoing, &mut self.link, now)?;
                }
            }
            FrameKind::Connect | FrameKind::Disconnect | FrameKind::ServerFull => {}
        }
        Ok(())
    }

    /// Ping emission, timeout sweep, retransmission sweep.
    fn tick(&mut self, now: Instant) -> Result<()> {
        let interval = self.config.ping_interval;
        for (addr, peer) in self.peers.iter_mut() {
            if let Some(ping) = peer.ping.poll(now, interval) {
                self.link.send(addr, &encode_frame(&self.pool, &ping, &[]))?;
            }
        }

        self.manager.check_timeout(now, &mut self.session_events);
        self.apply_session_events()?;

        for (addr, peer) in self.peers.iter_mut() {
            flush_outgoing(addr, &mut peer.outgoing, &mut self.link, now)?;
        }
        Ok(())
    }

    /// Act on lifecycle manager output: send control frames and create or
    /// tear down per-peer state. Every event is applied even if a send
    /// fails; the first failure is returned.
    fn apply_session_events(&mut self) -> Result<()> {
        let mut events = std::mem::take(&mut self.session_events);
        let mut first_error = None;
        for event in events.drain(..) {
            if let Err(e) = self.apply_session_event(event) {
                first_error.get_or_insert(e);
            }
        }
        self.session_events = events;
        first_error.map_or(Ok(()), Err)
    }

    fn apply_session_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Send { peer, kind } => {
                // Control frames carry no id.
                self.link.send(peer, &short_frame(&self.pool, kind, 0))?;
            }
            SessionEvent::Connected(peer) => {
                let state = Peer::new(&self.pool, self.config.initial_ack_wait);
                if self.peers.insert(peer, state).is_some() {
                    debug!(peer = %peer, peers = self.peers.len(), "peer state created");
                }
                let _ = self.events_tx.send(Event::Connected(peer));
            }
            SessionEvent::Disconnected(peer) => {
                // Dropping the state returns its buffers to the pool.
                if self.peers.remove(&peer).is_some() {
                    debug!(peer = %peer, peers = self.peers.len(), "peer state released");
                }
                let _ = self.events_tx.send(Event::Disconnected(peer));
            }
            SessionEvent::TimedOut(peer) => {
                let _ = self.events_tx.send(Event::ConnectionTimeout(peer));
            }
        }
        Ok(())
    }

    /// Send `payload` to `peer`.
    ///
    /// Reliable sends require live connection state for `peer` and are
    /// size-checked before anything is queued. Unreliable sends are a single
    /// datagram and are not retried.
    pub fn send(&mut self, peer: SocketAddr, payload: &[u8], mode: SendMode) -> Result<()> {
        match mode {
            SendMode::Unreliable => {
                let frame = self.unreliable.frame(&self.pool, payload)?;
                self.link.send(peer, &frame)?;
            }
            SendMode::Reliable => {
                let Some(state) = self.peers.get_mut_by_addr(&peer) else {
                    return Err(Error::UnrecognizedEndpoint(peer));
                };
                check_reliable_size(payload.len())?;
                state.outgoing.enqueue(self.pool.rent_copy(payload))?;
                let now = self.clock.now();
                flush_outgoing(peer, &mut state.outgoing, &mut self.link, now)?;
            }
        }
        self.link.stats.messages_sent += 1;
        Ok(())
    }

    /// Receiving side of the event channel.
    pub fn events(&self) -> &Receiver<Event> {
        &self.events_rx
    }

    /// Current mean RTT estimate for `peer`.
    pub fn rtt(&self, peer: &SocketAddr) -> Option<Duration> {
        self.peers.get_by_addr(peer).map(|p| p.ping.rtt())
    }

    pub fn reliable_progress(&self, peer: &SocketAddr) -> Option<ReliableProgress> {
        self.peers.get_by_addr(peer).map(|p| ReliableProgress {
            packet_id: p.outgoing.reliable_packet_id(),
            acknowledged_slices: p.outgoing.acknowledged_slices(),
            in_flight: p.outgoing.has_packets(),
            queued: p.outgoing.queued(),
        })
    }

    /// Whether per-peer protocol state exists for `peer`.
    pub fn has_peer(&self, peer: &SocketAddr) -> bool {
        self.peers.contains(peer)
    }

    pub fn stats(&self) -> EndpointStats {
        self.link.stats
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.link.transport.local_addr()?)
    }

    fn disconnect_peer(&mut self, peer: SocketAddr) -> Result<bool> {
        let known = self.manager.disconnect(peer, &mut self.session_events);
        self.apply_session_events()?;
        Ok(known)
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Connecting side. Talks to a single server.
pub struct Client<T> {
    endpoint: Endpoint<T, ClientSession>,
}

impl<T: DatagramTransport> Client<T> {
    pub fn new(transport: T, config: EndpointConfig) -> Self {
        Self::with_clock(transport, config, Clock::new())
    }

    pub fn with_clock(transport: T, config: EndpointConfig, clock: Clock) -> Self {
        let manager = ClientSession::new(config.connection_timeout);
        Client {
            endpoint: Endpoint::new(transport, manager, config, clock),
        }
    }

    /// Send a Connect request to `server`. Completion is reported as
    /// [`Event::Connected`] from a later poll.
    pub fn connect(&mut self, server: SocketAddr) -> Result<()> {
        if let Some(current) = self.server() {
            if self.is_connected() {
                self.endpoint.disconnect_peer(current)?;
            }
        }
        let now = self.endpoint.clock.now();
        self.endpoint
            .manager
            .connect(server, now, &mut self.endpoint.session_events);
        self.endpoint.apply_session_events()
    }

    /// Notify the server and release all state for it.
    pub fn disconnect(&mut self) -> Result<()> {
        let server = self.server().ok_or(Error::NotConnected)?;
        if !self.endpoint.disconnect_peer(server)? {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    pub fn send(&mut self, payload: &[u8], mode: SendMode) -> Result<()> {
        let server = self.server().ok_or(Error::NotConnected)?;
        self.endpoint.send(server, payload, mode)
    }

    pub fn poll(&mut self) -> Result<()> {
        self.endpoint.poll()
    }

    pub fn events(&self) -> &Receiver<Event> {
        self.endpoint.events()
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.manager.connected()
    }

    pub fn state(&self) -> ClientState {
        self.endpoint.manager.state()
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.endpoint.manager.server()
    }

    /// Mean RTT to the server.
    pub fn rtt(&self) -> Option<Duration> {
        self.server().and_then(|s| self.endpoint.rtt(&s))
    }

    pub fn reliable_progress(&self) -> Option<ReliableProgress> {
        self.server()
            .and_then(|s| self.endpoint.reliable_progress(&s))
    }

    pub fn stats(&self) -> EndpointStats {
        self.endpoint.stats()
    }

    pub fn endpoint(&self) -> &Endpoint<T, ClientSession> {
        &self.endpoint
    }
}

impl Client<UdpTransport> {
    /// Bind an ephemeral UDP socket suitable for reaching `server`.
    pub fn bind_for(server: SocketAddr, config: EndpointConfig) -> Result<Self> {
        Ok(Self::new(UdpTransport::bind_for(server)?, config))
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

/// Listening side. Accepts up to `max_connections` peers.
pub struct Server<T> {
    endpoint: Endpoint<T, ServerSessions>,
}

impl<T: DatagramTransport> Server<T> {
    pub fn new(transport: T, config: EndpointConfig) -> Self {
        Self::with_clock(transport, config, Clock::new())
    }

    pub fn with_clock(transport: T, config: EndpointConfig, clock: Clock) -> Self {
        let manager = ServerSessions::new(config.max_connections, config.connection_timeout);
        Server {
            endpoint: Endpoint::new(transport, manager, config, clock),
        }
    }

    /// Kick `peer`. Returns `false` if it was not connected.
    pub fn disconnect(&mut self, peer: SocketAddr) -> Result<bool> {
        self.endpoint.disconnect_peer(peer)
    }

    pub fn send(&mut self, peer: SocketAddr, payload: &[u8], mode: SendMode) -> Result<()> {
        self.endpoint.send(peer, payload, mode)
    }

    pub fn poll(&mut self) -> Result<()> {
        self.endpoint.poll()
    }

    pub fn events(&self) -> &Receiver<Event> {
        self.endpoint.events()
    }

    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        self.endpoint.manager.connected_peers()
    }

    pub fn is_connected(&self, peer: &SocketAddr) -> bool {
        self.endpoint.manager.is_connected(peer)
    }

    pub fn rtt(&self, peer: &SocketAddr) -> Option<Duration> {
        self.endpoint.rtt(peer)
    }

    pub fn reliable_progress(&self, peer: &SocketAddr) -> Option<ReliableProgress> {
        self.endpoint.reliable_progress(peer)
    }

    pub fn stats(&self) -> EndpointStats {
        self.endpoint.stats()
    }

    pub fn endpoint(&self) -> &Endpoint<T, ServerSessions> {
        &self.endpoint
    }
}

impl Server<UdpTransport> {
    /// Listen on `addr` with enlarged OS socket buffers.
    pub fn listen(addr: SocketAddr, config: EndpointConfig) -> Result<Self> {
        let transport = UdpTransport::bind(addr, Some(SERVER_SOCKET_BUFFER))?;
        Ok(Self::new(transport, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use crate::wire::FRAGMENT_SIZE;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pair() -> (
        Client<crate::transport::MemoryTransport>,
        Server<crate::transport::MemoryTransport>,
        std::sync::Arc<quanta::Mock>,
    ) {
        let net = MemoryNetwork::new();
        let (clock, mock) = Clock::mock();
        let server = Server::with_clock(
            net.bind(addr(1)).unwrap(),
            EndpointConfig::default(),
            clock.clone(),
        );
        let client = Client::with_clock(net.bind(addr(2)).unwrap(), EndpointConfig::default(), clock);
        (client, server, mock)
    }

    #[test]
    fn handshake_creates_peer_state_on_both_sides() {
        let (mut client, mut server, _mock) = pair();
        client.connect(addr(1)).unwrap();
        server.poll().unwrap();
        client.poll().unwrap();

        assert!(client.is_connected());
        assert!(server.is_connected(&addr(2)));
        assert!(client.endpoint().has_peer(&addr(1)));
        assert!(server.endpoint().has_peer(&addr(2)));
        assert!(matches!(client.events().try_recv(), Ok(Event::Connected(a)) if a == addr(1)));
        assert!(matches!(server.events().try_recv(), Ok(Event::Connected(a)) if a == addr(2)));
    }

    #[test]
    fn reliable_send_to_unknown_peer_fails() {
        let (_client, mut server, _mock) = pair();
        let err = server
            .send(addr(9), b"hello", SendMode::Reliable)
            .unwrap_err();
        assert!(matches!(err, Error::UnrecognizedEndpoint(a) if a == addr(9)));
        assert_eq!(server.stats().datagrams_sent, 0);
    }

    #[test]
    fn client_send_before_connect_is_not_connected() {
        let (mut client, _server, _mock) = pair();
        assert!(matches!(
            client.send(b"x", SendMode::Reliable),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn unknown_flags_fail_loudly() {
        let net = MemoryNetwork::new();
        let mut server = Server::new(net.bind(addr(1)).unwrap(), EndpointConfig::default());
        let mut rogue = net.bind(addr(3)).unwrap();
        rogue.try_send(addr(1), &[0x81, 1, 0, 0]).unwrap();
        assert!(matches!(server.poll(), Err(Error::UnknownFrame { flags: 0x81, .. })));
        // The receive slot is back in place after the error.
        assert!(server.poll().is_ok());
    }

    #[test]
    fn multi_slice_message_round_trip() {
        let (mut client, mut server, _mock) = pair();
        client.connect(addr(1)).unwrap();
        server.poll().unwrap();
        client.poll().unwrap();
        while client.events().try_recv().is_ok() {}
        while server.events().try_recv().is_ok() {}

        let payload: Vec<u8> = (0..FRAGMENT_SIZE * 2 + 5).map(|i| i as u8).collect();
        client.send(&payload, SendMode::Reliable).unwrap();
        server.poll().unwrap();
        client.poll().unwrap();

        match server.events().try_recv() {
            Ok(Event::Received { peer, mode, payload: got }) => {
                assert_eq!(peer, addr(2));
                assert_eq!(mode, SendMode::Reliable);
                assert_eq!(&got[..], &payload[..]);
            }
            other => panic!("unexpected {other:?}"),
        }
        let progress = client.reliable_progress().unwrap();
        assert_eq!(progress.acknowledged_slices, 3);
        assert!(!progress.in_flight);
    }
}
