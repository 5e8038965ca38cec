//! # Ping / RTT Estimation
//!
//! Each connected endpoint is probed at most once per ping interval. A probe
//! carries a 1-byte id in the low byte of the header's `packet_id`; the peer
//! echoes it back in a PingAck. The round-trip sample lands in a fixed ring
//! of [`RING_CAPACITY`] slots.
//!
//! The published estimate is the ring's sum divided by its capacity, not by
//! the number of samples taken. Until the ring fills, empty slots count as
//! zero and the estimate reads low.

use quanta::Instant;
use std::time::Duration;

use crate::wire::{FrameKind, Header};

/// RTT samples kept per endpoint.
pub const RING_CAPACITY: usize = 100;

// ─── RttTracker ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RttTracker {
    samples: [Duration; RING_CAPACITY],
    next: usize,
    filled: usize,
    sum: Duration,
}

impl RttTracker {
    pub fn new() -> Self {
        RttTracker {
            samples: [Duration::ZERO; RING_CAPACITY],
            next: 0,
            filled: 0,
            sum: Duration::ZERO,
        }
    }

    /// Record a sample, evicting the oldest once the ring is full.
    pub fn push(&mut self, sample: Duration) {
        self.sum -= self.samples[self.next];
        self.samples[self.next] = sample;
        self.sum += sample;
        self.next = (self.next + 1) % RING_CAPACITY;
        self.filled = (self.filled + 1).min(RING_CAPACITY);
    }

    /// Mean over the full ring capacity.
    pub fn mean(&self) -> Duration {
        self.sum / RING_CAPACITY as u32
    }

    /// Samples currently held (saturates at capacity).
    pub fn sample_count(&self) -> usize {
        self.filled
    }
}

impl Default for RttTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ─── PingState ───────────────────────────────────────────────────────────────

/// Per-endpoint probe bookkeeping.
#[derive(Debug, Clone)]
pub struct PingState {
    rtt: RttTracker,
    next_id: u8,
    last_sent: Option<Instant>,
    /// Id and send time of the probe still awaiting its ack.
    awaiting: Option<(u8, Instant)>,
}

impl PingState {
    pub fn new() -> Self {
        PingState {
            rtt: RttTracker::new(),
            next_id: 1,
            last_sent: None,
            awaiting: None,
        }
    }

    /// Returns the header of a probe to send now, or `None` if the last one
    /// went out less than `interval` ago.
    pub fn poll(&mut self, now: Instant, interval: Duration) -> Option<Header> {
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < interval {
                return None;
            }
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.last_sent = Some(now);
        self.awaiting = Some((id, now));
        Some(Header::short(FrameKind::Ping, id as u16))
    }

    /// Handle a PingAck. Returns the new mean RTT when the ack matches the
    /// outstanding probe; stale and duplicate acks yield `None`.
    pub fn on_ping_ack(&mut self, packet_id: u16, now: Instant) -> Option<Duration> {
        let (id, sent) = self.awaiting?;
        if packet_id as u8 != id {
            return None;
        }
        self.awaiting = None;
        self.rtt.push(now.saturating_duration_since(sent));
        Some(self.rtt.mean())
    }

    pub fn rtt(&self) -> Duration {
        self.rtt.mean()
    }

    pub fn tracker(&self) -> &RttTracker {
        &self.rtt
    }
}

impl Default for PingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Reply to a received Ping, echoing its id.
pub fn pong_for(ping: &Header) -> Header {
    Header::short(FrameKind::PingAck, ping.packet_id)
}
