//! # Incoming Reliable Handler
//!
//! Pure logic, no I/O. One handler per connected endpoint. Accepts reliable
//! slices for the expected message id, records them in a per-slice receipt
//! mask, advances the cumulative ACK cursor over the contiguous prefix, and
//! hands back the reassembled payload once every slice is in.
//!
//! Message ids wrap at `u16`. An id is "older" than the expected one when it
//! is smaller by at most half the id space, or larger by more than half
//! (the expected id wrapped past it).

use bit_set::BitSet;
use tracing::trace;

use crate::pool::{BufferPool, PooledBuf};
use crate::wire::{Header, FRAGMENT_SIZE, MAX_SLICES};

/// Half the message id space.
const HALF_ID_SPACE: u16 = u16::MAX / 2;

/// Wraparound-aware "already delivered" test for message ids.
pub fn is_older(id: u16, expected: u16) -> bool {
    if id < expected {
        expected - id <= HALF_ID_SPACE
    } else if id > expected {
        id - expected > HALF_ID_SPACE
    } else {
        false
    }
}

// ─── Receive outcome ─────────────────────────────────────────────────────────

/// What the caller must do after feeding a slice.
#[derive(Debug)]
pub enum SliceOutcome {
    /// Slice of an already-delivered message. Answer with `ack` so the
    /// sender stops retransmitting it. The ack covers every slice: an older
    /// id was delivered in full, and the sender ignores acks for ids other
    /// than its in-flight one.
    Stale { ack: Header },
    /// Slice at or below the ack cursor of the current message. No state
    /// change, no reply.
    Duplicate,
    /// Malformed or ahead of the expected message. Dropped silently.
    Ignored,
    /// Slice stored. `ack` is set when the cursor advanced; `delivered`
    /// holds the reassembled payload when the message completed.
    Accepted {
        ack: Option<Header>,
        delivered: Option<PooledBuf>,
    },
}

// ─── IncomingHandler ─────────────────────────────────────────────────────────

pub struct IncomingHandler {
    pool: BufferPool,
    /// Id of the message being assembled.
    expected_id: u16,
    /// Total slices of the current message; 0 until its first slice arrives.
    slice_count: u16,
    received: BitSet,
    /// Highest contiguous slice received (1-based; 0 = none).
    last_acknowledged: u16,
    reassembly: Option<PooledBuf>,
    /// Exact payload length, known once the final slice arrives.
    byte_len: usize,
}

impl IncomingHandler {
    pub fn new(pool: BufferPool) -> Self {
        IncomingHandler {
            pool,
            expected_id: 1,
            slice_count: 0,
            received: BitSet::new(),
            last_acknowledged: 0,
            reassembly: None,
            byte_len: 0,
        }
    }

    /// Feed one reliable slice (`header.kind == Reliable`) and its payload.
    pub fn on_slice(&mut self, header: &Header, payload: &[u8]) -> SliceOutcome {
        if is_older(header.packet_id, self.expected_id) {
            return SliceOutcome::Stale {
                ack: Header::ack(header.packet_id, header.slice_count, header.slice_count),
            };
        }
        if header.packet_id != self.expected_id {
            trace!(
                packet_id = header.packet_id,
                expected = self.expected_id,
                "slice ahead of expected message: dropped"
            );
            return SliceOutcome::Ignored;
        }

        // No conforming sender produces MAX_SLICES or more.
        if header.slice_count == 0 || header.slice_count as usize >= MAX_SLICES {
            trace!(slices = header.slice_count, "slice count out of range: dropped");
            return SliceOutcome::Ignored;
        }
        let seq = header.seq;
        if seq == 0 || seq > header.slice_count || payload.len() > FRAGMENT_SIZE {
            return SliceOutcome::Ignored;
        }
        if self.slice_count == 0 {
            self.begin(header.slice_count);
        } else if header.slice_count != self.slice_count {
            return SliceOutcome::Ignored;
        }
        if seq <= self.last_acknowledged || self.received.contains(seq as usize) {
            return SliceOutcome::Duplicate;
        }
        // Only the final slice may be short.
        if seq < self.slice_count && payload.len() != FRAGMENT_SIZE {
            return SliceOutcome::Ignored;
        }

        let Some(buf) = self.reassembly.as_mut() else {
            return SliceOutcome::Ignored;
        };
        let offset = (seq as usize - 1) * FRAGMENT_SIZE;
        buf[offset..offset + payload.len()].copy_from_slice(payload);
        self.received.insert(seq as usize);
        if seq == self.slice_count {
            self.byte_len = offset + payload.len();
        }

        let before = self.last_acknowledged;
        while self.last_acknowledged < self.slice_count
            && self.received.contains(self.last_acknowledged as usize + 1)
        {
            self.last_acknowledged += 1;
        }
        let ack = (self.last_acknowledged > before).then(|| {
            Header::ack(self.expected_id, self.slice_count, self.last_acknowledged)
        });

        let delivered = if self.last_acknowledged == self.slice_count {
            self.finish()
        } else {
            None
        };

        SliceOutcome::Accepted { ack, delivered }
    }

    fn begin(&mut self, slice_count: u16) {
        self.slice_count = slice_count;
        self.received.clear();
        self.last_acknowledged = 0;
        self.byte_len = 0;
        self.reassembly = Some(self.pool.rent(slice_count as usize * FRAGMENT_SIZE));
    }

    /// Hand out the reassembled payload and prepare for the next message id.
    fn finish(&mut self) -> Option<PooledBuf> {
        let mut payload = self.reassembly.take()?;
        payload.truncate(self.byte_len);
        trace!(
            packet_id = self.expected_id,
            slices = self.slice_count,
            bytes = self.byte_len,
            "reliable message reassembled"
        );

        self.expected_id = self.expected_id.wrapping_add(1);
        self.slice_count = 0;
        self.received.clear();
        self.last_acknowledged = 0;
        self.byte_len = 0;
        Some(payload)
    }

    /// Id of the message currently accepted.
    pub fn expected_id(&self) -> u16 {
        self.expected_id
    }

    pub fn last_acknowledged(&self) -> u16 {
        self.last_acknowledged
    }

    /// Total slices of the message being assembled (0 between messages).
    pub fn slice_count(&self) -> u16 {
        self.slice_count
    }

    /// Whether a partially assembled message is held.
    pub fn is_assembling(&self) -> bool {
        self.reassembly.is_some()
    }
}
