//! # Outgoing Reliable Handler
//!
//! Pure logic, no I/O. One handler per connected endpoint. Accepts
//! application messages, slices them into MTU-sized reliable frames, tracks
//! the cumulative ACK reported by the peer, and decides when the
//! unacknowledged tail is due for retransmission.
//!
//! ## Rules
//!
//! 1. **One message in flight**: later messages wait in a FIFO until the
//!    current one is fully acknowledged.
//! 2. **Cumulative retransmission**: a due round re-emits every slice from
//!    the acknowledged cursor onward, not just the oldest one.
//! 3. **Linear backoff**: every send round grows the wait by the RTT-derived
//!    base amount. There is no retry limit.

use quanta::Instant;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::trace;

use crate::error::{Error, Result};
use crate::pool::{BufferPool, PooledBuf};
use crate::wire::{encode_frame, Header, FRAGMENT_SIZE, MAX_RELIABLE_PAYLOAD, MAX_SLICES};

/// Number of slices needed for a payload of `len` bytes. An empty payload
/// still occupies one (empty) slice.
pub fn slice_count_for(len: usize) -> usize {
    len.div_ceil(FRAGMENT_SIZE).max(1)
}

/// Reject payloads whose slice count is not representable.
pub fn check_reliable_size(len: usize) -> Result<usize> {
    let slices = slice_count_for(len);
    if slices >= MAX_SLICES {
        return Err(Error::PacketTooBigToSend {
            len,
            max: MAX_RELIABLE_PAYLOAD,
        });
    }
    Ok(slices)
}

// ─── Ack outcome ─────────────────────────────────────────────────────────────

/// Effect of an incoming acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Stale, duplicate, or for a message that is no longer in flight.
    Ignored,
    /// Cursor moved (or held) but the message is not complete yet.
    Progress { acknowledged: u16 },
    /// Every slice acknowledged. `next_started` tells whether a queued
    /// message was sliced in its place.
    Completed { packet_id: u16, next_started: bool },
}

// ─── OutgoingHandler ─────────────────────────────────────────────────────────

pub struct OutgoingHandler {
    pool: BufferPool,
    reliable_packet_id: u16,
    /// Encoded frames of the in-flight message, in slice order.
    slices: Vec<PooledBuf>,
    /// Messages not yet started.
    queue: VecDeque<PooledBuf>,
    acknowledged: u16,
    last_send: Option<Instant>,
    /// RTT-derived wait unit.
    base_wait: Duration,
    /// Current wait before the tail is due again.
    wait: Duration,
    /// Send rounds for the in-flight message.
    rounds: u32,
}

impl OutgoingHandler {
    pub fn new(pool: BufferPool, initial_wait: Duration) -> Self {
        OutgoingHandler {
            pool,
            reliable_packet_id: 0,
            slices: Vec::new(),
            queue: VecDeque::new(),
            acknowledged: 0,
            last_send: None,
            base_wait: initial_wait,
            wait: initial_wait,
            rounds: 0,
        }
    }

    /// Queue a message. It is sliced immediately if nothing is in flight.
    ///
    /// Oversized messages are rejected here, before anything is queued.
    pub fn enqueue(&mut self, message: PooledBuf) -> Result<()> {
        check_reliable_size(message.len())?;
        self.queue.push_back(message);
        if !self.has_packets() {
            self.start_next();
        }
        Ok(())
    }

    fn start_next(&mut self) -> bool {
        let Some(message) = self.queue.pop_front() else {
            return false;
        };

        self.wait = self.base_wait;
        self.last_send = None;
        self.acknowledged = 0;
        self.rounds = 0;
        self.reliable_packet_id = self.reliable_packet_id.wrapping_add(1);

        // Size was validated on enqueue.
        let count = slice_count_for(message.len());
        self.slices.clear();
        self.slices.reserve(count);
        for (i, chunk) in message.chunks(FRAGMENT_SIZE).enumerate() {
            let header = Header::reliable(self.reliable_packet_id, count as u16, (i + 1) as u16);
            self.slices.push(encode_frame(&self.pool, &header, chunk));
        }
        if self.slices.is_empty() {
            let header = Header::reliable(self.reliable_packet_id, 1, 1);
            self.slices.push(encode_frame(&self.pool, &header, &[]));
        }

        trace!(
            packet_id = self.reliable_packet_id,
            slices = count,
            bytes = message.len(),
            "reliable message started"
        );
        true
    }

    /// Frames due at `now`: the unacknowledged tail, or nothing if the wait
    /// interval has not elapsed since the last round.
    pub fn packets_to_send(&self, now: Instant) -> &[PooledBuf] {
        if self.slices.is_empty() {
            return &[];
        }
        let due = match self.last_send {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.wait,
        };
        if !due {
            return &[];
        }
        &self.slices[self.acknowledged as usize..]
    }

    /// Record a send round: restart the countdown and grow the wait.
    pub fn mark_sent(&mut self, now: Instant) {
        if self.rounds > 0 {
            trace!(
                packet_id = self.reliable_packet_id,
                round = self.rounds,
                acknowledged = self.acknowledged,
                wait_ms = self.wait.as_millis() as u64,
                "retransmitting unacknowledged tail"
            );
        }
        self.last_send = Some(now);
        self.wait += self.base_wait;
        self.rounds += 1;
    }

    /// Apply an acknowledgment carrying cursor `ack` for message `packet_id`.
    /// The cursor never regresses.
    pub fn on_ack(&mut self, packet_id: u16, ack: u16) -> AckOutcome {
        if !self.has_packets() || packet_id != self.reliable_packet_id {
            return AckOutcome::Ignored;
        }

        let total = self.slices.len() as u16;
        let ack = ack.min(total);
        if ack > self.acknowledged {
            self.acknowledged = ack;
        }
        if self.acknowledged < total {
            return AckOutcome::Progress {
                acknowledged: self.acknowledged,
            };
        }

        trace!(packet_id, slices = total, rounds = self.rounds, "reliable message acknowledged");
        // Dropping the frames hands them back to the pool.
        self.slices.clear();
        let next_started = self.start_next();
        AckOutcome::Completed {
            packet_id,
            next_started,
        }
    }

    /// Feed a new RTT estimate into the retransmission timer.
    pub fn on_rtt_updated(&mut self, rtt: Duration) {
        self.base_wait = rtt + Duration::from_millis(1);
    }

    /// Whether a message is in flight.
    pub fn has_packets(&self) -> bool {
        !self.slices.is_empty()
    }

    /// Nothing in flight and nothing queued.
    pub fn is_idle(&self) -> bool {
        self.slices.is_empty() && self.queue.is_empty()
    }

    pub fn reliable_packet_id(&self) -> u16 {
        self.reliable_packet_id
    }

    pub fn acknowledged_slices(&self) -> u16 {
        self.acknowledged
    }

    /// Slices of the in-flight message (0 when idle).
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Messages waiting behind the in-flight one.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn base_wait(&self) -> Duration {
        self.base_wait
    }

    pub fn current_wait(&self) -> Duration {
        self.wait
    }

    /// Send rounds performed for the in-flight message.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }
}
