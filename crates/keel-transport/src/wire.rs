//! # Keel Wire Format
//!
//! Fixed-layout header, all multi-byte fields little-endian.
//!
//! ```text
//!  byte 0      1        2..4          4..6            6..8
//! +-------+---------+-----------+---------------+---------------+
//! | flags | version | packet_id | slice_count   | seq_or_ack    |
//! +-------+---------+-----------+---------------+---------------+
//!  \____________ 4 bytes ______/ \___ reliable and ack only ____/
//! ```
//!
//! `flags` is a bitset, but only the exact values listed in [`FrameKind`]
//! appear on the wire. `Reliable | Ack` marks an acknowledgment that reuses
//! the reliable header; it is not a separate packet type.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::pool::{BufferPool, PooledBuf};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest datagram either side will send.
pub const MTU: usize = 1200;

/// flags + version + packet_id.
pub const HEADER_SIZE: usize = 4;

/// Base header + slice_count + seq_or_ack.
pub const RELIABLE_HEADER_SIZE: usize = 8;

/// Payload bytes carried by one reliable slice.
pub const FRAGMENT_SIZE: usize = MTU - RELIABLE_HEADER_SIZE;

/// Slice counts at or above this are not representable.
pub const MAX_SLICES: usize = u16::MAX as usize - 1;

/// Largest payload a reliable message may carry.
pub const MAX_RELIABLE_PAYLOAD: usize = FRAGMENT_SIZE * (MAX_SLICES - 1);

/// Largest payload that fits into one unreliable datagram.
pub const MAX_UNRELIABLE_PAYLOAD: usize = MTU - HEADER_SIZE;

// ─── Flags ───────────────────────────────────────────────────────────────────

bitflags! {
    /// Header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        const CONNECT     = 0b0000_0001;
        const DISCONNECT  = 0b0000_0010;
        const SERVER_FULL = 0b0000_0100;
        const PING        = 0b0000_1000;
        const PING_ACK    = 0b0001_0000;
        const UNRELIABLE  = 0b0010_0000;
        const RELIABLE    = 0b0100_0000;
        const ACK         = 0b1000_0000;
    }
}

/// Every flag combination the protocol puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Connect,
    Disconnect,
    ServerFull,
    Ping,
    PingAck,
    Unreliable,
    Reliable,
    ReliableAck,
}

impl FrameKind {
    /// Classify a raw flags byte. Returns `None` for combinations the
    /// protocol never emits.
    pub fn from_flags(bits: u8) -> Option<Self> {
        let flags = PacketFlags::from_bits(bits)?;
        let kind = if flags == PacketFlags::CONNECT {
            FrameKind::Connect
        } else if flags == PacketFlags::DISCONNECT {
            FrameKind::Disconnect
        } else if flags == PacketFlags::SERVER_FULL {
            FrameKind::ServerFull
        } else if flags == PacketFlags::PING {
            FrameKind::Ping
        } else if flags == PacketFlags::PING_ACK {
            FrameKind::PingAck
        } else if flags == PacketFlags::UNRELIABLE {
            FrameKind::Unreliable
        } else if flags == PacketFlags::RELIABLE {
            FrameKind::Reliable
        } else if flags == PacketFlags::RELIABLE | PacketFlags::ACK {
            FrameKind::ReliableAck
        } else {
            return None;
        };
        Some(kind)
    }

    pub fn flags(self) -> PacketFlags {
        match self {
            FrameKind::Connect => PacketFlags::CONNECT,
            FrameKind::Disconnect => PacketFlags::DISCONNECT,
            FrameKind::ServerFull => PacketFlags::SERVER_FULL,
            FrameKind::Ping => PacketFlags::PING,
            FrameKind::PingAck => PacketFlags::PING_ACK,
            FrameKind::Unreliable => PacketFlags::UNRELIABLE,
            FrameKind::Reliable => PacketFlags::RELIABLE,
            FrameKind::ReliableAck => PacketFlags::RELIABLE | PacketFlags::ACK,
        }
    }

    /// Encoded header length for this kind.
    pub fn header_len(self) -> usize {
        match self {
            FrameKind::Reliable | FrameKind::ReliableAck => RELIABLE_HEADER_SIZE,
            _ => HEADER_SIZE,
        }
    }

    /// Connect, Disconnect, and ServerFull belong to the lifecycle manager.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            FrameKind::Connect | FrameKind::Disconnect | FrameKind::ServerFull
        )
    }
}

// ─── Header ──────────────────────────────────────────────────────────────────

/// Decoded frame header. `slice_count` and `seq` are zero for 4-byte frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: FrameKind,
    pub version: u8,
    pub packet_id: u16,
    pub slice_count: u16,
    /// 1-based slice index on reliable frames, ack cursor on ack frames.
    pub seq: u16,
}

impl Header {
    /// Header for a 4-byte frame.
    pub fn short(kind: FrameKind, packet_id: u16) -> Self {
        Header {
            kind,
            version: PROTOCOL_VERSION,
            packet_id,
            slice_count: 0,
            seq: 0,
        }
    }

    /// Header for one slice of a reliable message.
    pub fn reliable(packet_id: u16, slice_count: u16, seq: u16) -> Self {
        Header {
            kind: FrameKind::Reliable,
            version: PROTOCOL_VERSION,
            packet_id,
            slice_count,
            seq,
        }
    }

    /// Header for an acknowledgment of `packet_id` up to slice `ack`.
    pub fn ack(packet_id: u16, slice_count: u16, ack: u16) -> Self {
        Header {
            kind: FrameKind::ReliableAck,
            version: PROTOCOL_VERSION,
            packet_id,
            slice_count,
            seq: ack,
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.kind.header_len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.flags().bits());
        buf.put_u8(self.version);
        buf.put_u16_le(self.packet_id);
        if self.kind.header_len() == RELIABLE_HEADER_SIZE {
            buf.put_u16_le(self.slice_count);
            buf.put_u16_le(self.seq);
        }
    }

    /// Decode the header at the start of `datagram`.
    ///
    /// Unknown flag combinations, short datagrams, and foreign versions are
    /// framing defects and come back as errors rather than being skipped.
    pub fn decode(datagram: &[u8], from: SocketAddr) -> Result<Self> {
        let mut cur = datagram;
        if !cur.has_remaining() {
            return Err(Error::Truncated { len: 0, from });
        }
        let flags = cur.get_u8();
        let kind = FrameKind::from_flags(flags).ok_or(Error::UnknownFrame { flags, from })?;
        if datagram.len() < kind.header_len() {
            return Err(Error::Truncated {
                len: datagram.len(),
                from,
            });
        }

        let version = cur.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
                from,
            });
        }
        let packet_id = cur.get_u16_le();
        let (slice_count, seq) = if kind.header_len() == RELIABLE_HEADER_SIZE {
            (cur.get_u16_le(), cur.get_u16_le())
        } else {
            (0, 0)
        };

        Ok(Header {
            kind,
            version,
            packet_id,
            slice_count,
            seq,
        })
    }
}

// ─── Frame builders ──────────────────────────────────────────────────────────

/// Encode `header` followed by `payload` into a pooled buffer.
pub fn encode_frame(pool: &BufferPool, header: &Header, payload: &[u8]) -> PooledBuf {
    let mut frame = pool.rent(0);
    let buf = frame.bytes_mut();
    buf.reserve(header.encoded_len() + payload.len());
    header.encode(buf);
    buf.put_slice(payload);
    frame
}

/// A 4-byte control, ping, or ping-ack frame.
pub fn short_frame(pool: &BufferPool, kind: FrameKind, packet_id: u16) -> PooledBuf {
    encode_frame(pool, &Header::short(kind, packet_id), &[])
}

/// An acknowledgment frame.
pub fn ack_frame(pool: &BufferPool, packet_id: u16, slice_count: u16, ack: u16) -> PooledBuf {
    encode_frame(pool, &Header::ack(packet_id, slice_count, ack), &[])
}

/// Payload bytes following the header of a decoded frame.
pub fn frame_payload<'a>(datagram: &'a [u8], header: &Header) -> &'a [u8] {
    &datagram[header.encoded_len()..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn constants_match_layout() {
        assert_eq!(HEADER_SIZE, 4);
        assert_eq!(RELIABLE_HEADER_SIZE, 8);
        assert_eq!(FRAGMENT_SIZE, 1192);
        assert_eq!(MAX_SLICES, 65534);
    }

    #[test]
    fn reliable_header_is_little_endian() {
        let mut buf = Vec::new();
        Header::reliable(0x0102, 0x0304, 0x0506).encode(&mut buf);
        assert_eq!(buf, [0x40, 1, 0x02, 0x01, 0x04, 0x03, 0x06, 0x05]);
    }

    #[test]
    fn short_header_is_four_bytes() {
        let mut buf = Vec::new();
        Header::short(FrameKind::Ping, 7).encode(&mut buf);
        assert_eq!(buf, [0x08, 1, 7, 0]);
    }

    #[test]
    fn ack_header_combines_reliable_and_ack_bits() {
        let mut buf = Vec::new();
        Header::ack(9, 3, 2).encode(&mut buf);
        assert_eq!(buf[0], 0xC0);
        let decoded = Header::decode(&buf, addr()).unwrap();
        assert_eq!(decoded.kind, FrameKind::ReliableAck);
        assert_eq!(decoded.packet_id, 9);
        assert_eq!(decoded.slice_count, 3);
        assert_eq!(decoded.seq, 2);
    }

    #[test]
    fn classify_every_known_kind() {
        let kinds = [
            FrameKind::Connect,
            FrameKind::Disconnect,
            FrameKind::ServerFull,
            FrameKind::Ping,
            FrameKind::PingAck,
            FrameKind::Unreliable,
            FrameKind::Reliable,
            FrameKind::ReliableAck,
        ];
        for kind in kinds {
            assert_eq!(FrameKind::from_flags(kind.flags().bits()), Some(kind));
        }
    }

    #[test]
    fn unknown_combinations_are_rejected() {
        // Lone Ack, empty flags, and mixed control bits never appear on the wire.
        for bits in [0x00u8, 0x80, 0x03, 0x41, 0x28] {
            assert_eq!(FrameKind::from_flags(bits), None, "bits {bits:#04x}");
        }
        let err = Header::decode(&[0x80, 1, 0, 0], addr()).unwrap_err();
        assert!(matches!(err, Error::UnknownFrame { flags: 0x80, .. }));
    }

    #[test]
    fn truncated_reliable_header_is_an_error() {
        let err = Header::decode(&[0x40, 1, 0, 0, 1], addr()).unwrap_err();
        assert!(matches!(err, Error::Truncated { len: 5, .. }));
        let err = Header::decode(&[], addr()).unwrap_err();
        assert!(matches!(err, Error::Truncated { len: 0, .. }));
    }

    #[test]
    fn version_mismatch_is_an_error() {
        let err = Header::decode(&[0x20, 2, 0, 0], addr()).unwrap_err();
        assert!(matches!(
            err,
            Error::VersionMismatch {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn encode_frame_appends_payload() {
        let pool = BufferPool::new(4);
        let header = Header::short(FrameKind::Unreliable, 42);
        let frame = encode_frame(&pool, &header, b"abc");
        assert_eq!(frame.len(), HEADER_SIZE + 3);
        let decoded = Header::decode(&frame, addr()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(frame_payload(&frame, &decoded), b"abc");
    }
}
