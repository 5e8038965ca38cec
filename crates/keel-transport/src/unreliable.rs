//! # Unreliable Channel
//!
//! Fire-and-forget datagrams: a 4-byte header with an incrementing id, no
//! acknowledgment, no retransmission, no reordering.

use crate::error::{Error, Result};
use crate::pool::{BufferPool, PooledBuf};
use crate::wire::{encode_frame, frame_payload, FrameKind, Header, MAX_UNRELIABLE_PAYLOAD};

#[derive(Debug, Default)]
pub struct UnreliableChannel {
    next_id: u16,
}

impl UnreliableChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame `payload` for sending. The id advances even if the datagram is
    /// later dropped by the transport.
    pub fn frame(&mut self, pool: &BufferPool, payload: &[u8]) -> Result<PooledBuf> {
        if payload.len() > MAX_UNRELIABLE_PAYLOAD {
            return Err(Error::PacketTooBigToSend {
                len: payload.len(),
                max: MAX_UNRELIABLE_PAYLOAD,
            });
        }
        let header = Header::short(FrameKind::Unreliable, self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        Ok(encode_frame(pool, &header, payload))
    }

    /// Strip the header off a received unreliable datagram.
    pub fn strip(pool: &BufferPool, datagram: &[u8], header: &Header) -> PooledBuf {
        pool.rent_copy(frame_payload(datagram, header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::HEADER_SIZE;
    use std::net::SocketAddr;

    #[test]
    fn frames_carry_incrementing_ids() {
        let pool = BufferPool::new(4);
        let mut channel = UnreliableChannel::new();
        let from: SocketAddr = "127.0.0.1:1".parse().unwrap();

        for expected in 0..3u16 {
            let frame = channel.frame(&pool, b"tick").unwrap();
            let header = Header::decode(&frame, from).unwrap();
            assert_eq!(header.kind, FrameKind::Unreliable);
            assert_eq!(header.packet_id, expected);
            assert_eq!(frame.len(), HEADER_SIZE + 4);
            assert_eq!(&UnreliableChannel::strip(&pool, &frame, &header)[..], b"tick");
        }
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let pool = BufferPool::new(4);
        let mut channel = UnreliableChannel::new();
        assert!(channel.frame(&pool, &[0; MAX_UNRELIABLE_PAYLOAD]).is_ok());
        let err = channel
            .frame(&pool, &[0; MAX_UNRELIABLE_PAYLOAD + 1])
            .unwrap_err();
        assert!(matches!(err, Error::PacketTooBigToSend { max: MAX_UNRELIABLE_PAYLOAD, .. }));

        // The rejected payload did not consume an id.
        let from: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let next = channel.frame(&pool, b"x").unwrap();
        assert_eq!(Header::decode(&next, from).unwrap().packet_id, 1);
    }
}
