//! # keel-transport
//!
//! Reliable, ordered, fragmented message delivery over UDP datagrams.
//!
//! A connection handshake with liveness timeout, ping-based RTT estimation,
//! and a reliable channel that slices large messages into MTU-sized
//! fragments, tracks a cumulative ACK cursor over a selective receipt mask,
//! and retransmits the unacknowledged tail on an RTT-derived linear backoff.
//! An unreliable fire-and-forget channel shares the same socket.
//!
//! Everything below [`endpoint`] is pure logic with no I/O. The dispatcher
//! is driven by explicit [`poll`](endpoint::Endpoint::poll) calls; there are
//! no background threads or timers.
//!
//! ## Crate structure
//!
//! - [`wire`]: header layout, flag classification, frame builders
//! - [`pool`]: buffer arena with RAII return
//! - [`peers`]: slot-indexed per-endpoint records
//! - [`sender`]: outgoing reliable handler
//! - [`receiver`]: incoming reliable handler and reassembly
//! - [`ping`]: probes and the RTT ring
//! - [`session`]: client and server lifecycle managers
//! - [`unreliable`]: unreliable channel
//! - [`transport`]: datagram transport trait, UDP and in-memory networks
//! - [`endpoint`]: dispatcher, `Client` and `Server` facades
//! - [`config`]: endpoint configuration
//! - [`stats`]: endpoint counters
//! - [`error`]: error type

pub mod config;
pub mod endpoint;
pub mod error;
pub mod peers;
pub mod ping;
pub mod pool;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod transport;
pub mod unreliable;
pub mod wire;

pub use config::{EndpointConfig, EndpointConfigInput};
pub use endpoint::{Client, Endpoint, Event, ReliableProgress, SendMode, Server};
pub use error::{Error, Result};
pub use pool::{BufferPool, PooledBuf};
pub use transport::{DatagramTransport, Impairment, MemoryNetwork, MemoryTransport, UdpTransport};
