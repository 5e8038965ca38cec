//! # Datagram Transports
//!
//! [`DatagramTransport`] is the only I/O seam of the crate: non-blocking
//! send/receive of single datagrams keyed by endpoint. A send that would
//! block reports `false` and the caller treats the datagram as lost.
//!
//! Two implementations:
//! - [`UdpTransport`]: a non-blocking `std::net::UdpSocket` configured
//!   through `socket2` (OS buffer sizing).
//! - [`MemoryNetwork`]: an in-process network with seeded loss,
//!   duplication, and reordering for deterministic tests and simulation.

use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// OS socket buffer size requested for servers.
pub const SERVER_SOCKET_BUFFER: usize = 32 * 1024 * 1024;

/// Non-blocking datagram I/O.
pub trait DatagramTransport {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Send one datagram. `Ok(false)` means the send would have blocked and
    /// the datagram was dropped.
    fn try_send(&mut self, to: SocketAddr, datagram: &[u8]) -> io::Result<bool>;

    /// Receive one datagram into `buf`. `Ok(None)` when nothing is pending.
    fn try_receive(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

// ─── UDP ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a non-blocking UDP socket. `buffer_size` sets both OS buffers
    /// when given.
    pub fn bind(addr: SocketAddr, buffer_size: Option<usize>) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Some(size) = buffer_size {
            socket.set_recv_buffer_size(size)?;
            socket.set_send_buffer_size(size)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let socket: UdpSocket = socket.into();
        debug!(local = %socket.local_addr()?, "udp transport bound");
        Ok(UdpTransport { socket })
    }

    /// Client socket on an ephemeral port of the wildcard address matching
    /// `server`'s family.
    pub fn bind_for(server: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        Self::bind(local, None)
    }
}

impl DatagramTransport for UdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn try_send(&mut self, to: SocketAddr, datagram: &[u8]) -> io::Result<bool> {
        match self.socket.send_to(datagram, to) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn try_receive(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // Windows reports ICMP port-unreachable on the next recv.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ─── In-memory network ───────────────────────────────────────────────────────

/// Impairments applied by a [`MemoryNetwork`] to every datagram sent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Impairment {
    /// Probability (0-100) that a datagram is dropped.
    pub loss_percent: f32,
    /// Probability (0-100) that a delivered datagram is delivered twice.
    pub duplicate_percent: f32,
    /// Probability (0-100) that a datagram overtakes the one queued before it.
    pub reorder_percent: f32,
}

impl Impairment {
    pub fn loss(loss_percent: f32) -> Self {
        Impairment {
            loss_percent,
            ..Self::default()
        }
    }
}

/// Counters kept by a [`MemoryNetwork`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkCounters {
    pub delivered: u64,
    pub lost: u64,
    pub duplicated: u64,
    pub reordered: u64,
    /// Sends refused because the destination queue was full.
    pub would_block: u64,
}

type Queue = VecDeque<(SocketAddr, Vec<u8>)>;

struct NetworkInner {
    queues: HashMap<SocketAddr, Queue>,
    impairment: Impairment,
    rng: StdRng,
    queue_capacity: usize,
    counters: NetworkCounters,
}

impl NetworkInner {
    fn roll(&mut self, percent: f32) -> bool {
        percent > 0.0 && self.rng.random::<f64>() * 100.0 < percent as f64
    }
}

/// In-process datagram network. Cloning shares the network.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    /// A perfect network.
    pub fn new() -> Self {
        Self::with_impairment(Impairment::default(), 0)
    }

    /// A network applying `impairment`, driven by an RNG seeded with `seed`.
    pub fn with_impairment(impairment: Impairment, seed: u64) -> Self {
        MemoryNetwork {
            inner: Arc::new(Mutex::new(NetworkInner {
                queues: HashMap::new(),
                impairment,
                rng: StdRng::seed_from_u64(seed),
                queue_capacity: 4096,
                counters: NetworkCounters::default(),
            })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach an endpoint at `addr`.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<MemoryTransport> {
        let mut inner = self.inner();
        if inner.queues.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            ));
        }
        inner.queues.insert(addr, VecDeque::new());
        Ok(MemoryTransport {
            addr,
            network: self.clone(),
        })
    }

    /// Replace the impairment applied to subsequent sends.
    pub fn set_impairment(&self, impairment: Impairment) {
        self.inner().impairment = impairment;
    }

    /// Per-endpoint queue depth beyond which sends report would-block.
    pub fn set_queue_capacity(&self, capacity: usize) {
        self.inner().queue_capacity = capacity;
    }

    pub fn counters(&self) -> NetworkCounters {
        self.inner().counters
    }

    /// Datagrams waiting for `addr`.
    pub fn pending(&self, addr: &SocketAddr) -> usize {
        self.inner().queues.get(addr).map_or(0, VecDeque::len)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint on a [`MemoryNetwork`]. Unbinds on drop.
pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl DatagramTransport for MemoryTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn try_send(&mut self, to: SocketAddr, datagram: &[u8]) -> io::Result<bool> {
        let mut inner = self.network.inner();
        let capacity = inner.queue_capacity;
        match inner.queues.get(&to).map(VecDeque::len) {
            // Nobody listening: the datagram vanishes, as with UDP.
            None => return Ok(true),
            Some(depth) if depth >= capacity => {
                inner.counters.would_block += 1;
                return Ok(false);
            }
            Some(_) => {}
        }

        let impairment = inner.impairment;
        if inner.roll(impairment.loss_percent) {
            inner.counters.lost += 1;
            return Ok(true);
        }
        let duplicate = inner.roll(impairment.duplicate_percent);
        let reorder = inner.roll(impairment.reorder_percent);

        let from = self.addr;
        let NetworkInner {
            queues, counters, ..
        } = &mut *inner;
        let Some(queue) = queues.get_mut(&to) else {
            return Ok(true);
        };
        queue.push_back((from, datagram.to_vec()));
        counters.delivered += 1;
        if duplicate {
            queue.push_back((from, datagram.to_vec()));
            counters.duplicated += 1;
        }
        if reorder && queue.len() >= 2 {
            let last = queue.len() - 1;
            queue.swap(last, last - 1);
            counters.reordered += 1;
        }
        Ok(true)
    }

    fn try_receive(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut inner = self.network.inner();
        let Some((from, datagram)) = inner.queues.get_mut(&self.addr).and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        // Oversized datagrams are truncated like a short recv buffer would.
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(Some((len, from)))
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.inner().queues.remove(&self.addr);
    }
}
