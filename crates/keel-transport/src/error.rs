//! Error types for the Keel transport.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for Keel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the transport.
///
/// Datagram loss, duplication, and reordering never show up here. They are
/// absorbed by retransmission and stale-fragment detection.
#[derive(Error, Debug)]
pub enum Error {
    /// Reliable send to an endpoint that has no live connection state.
    #[error("no connection registered for endpoint {0}")]
    UnrecognizedEndpoint(SocketAddr),

    /// Payload cannot be represented within the slice-count limit (or, for
    /// unreliable sends, within a single datagram).
    #[error("payload of {len} bytes is too big to send (limit {max} bytes)")]
    PacketTooBigToSend { len: usize, max: usize },

    /// The server answered the handshake with ServerFull.
    #[error("connection refused: server {0} is at capacity")]
    ServerAtCapacity(SocketAddr),

    /// A datagram carried a flag combination this protocol never emits.
    #[error("unrecognized frame flags {flags:#04x} from {from}")]
    UnknownFrame { flags: u8, from: SocketAddr },

    /// A datagram was shorter than the header its flags announce.
    #[error("truncated datagram ({len} bytes) from {from}")]
    Truncated { len: usize, from: SocketAddr },

    /// Protocol version byte does not match ours.
    #[error("protocol version mismatch: expected {expected}, got {actual} from {from}")]
    VersionMismatch {
        expected: u8,
        actual: u8,
        from: SocketAddr,
    },

    /// Client operation that requires a handshake in progress or completed.
    #[error("client is not connected")]
    NotConnected,

    /// Invalid configuration input.
    #[error("configuration error: {0}")]
    Config(String),

    /// Datagram socket I/O failure.
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_endpoint() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let msg = Error::UnrecognizedEndpoint(addr).to_string();
        assert!(msg.contains("127.0.0.1:4000"));
    }

    #[test]
    fn unknown_frame_prints_hex_flags() {
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let msg = Error::UnknownFrame { flags: 0x81, from }.to_string();
        assert!(msg.contains("0x81"), "{msg}");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
