//! # Endpoint Statistics
//!
//! Counters kept by the dispatcher. Serializable for JSON output.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    /// Datagrams handed to the transport and accepted.
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    /// Received datagrams that failed to decode or were refused.
    pub rejected_datagrams: u64,
    /// Sends dropped because the transport would block.
    pub send_drops: u64,
    /// Reliable slices sent again after their first round.
    pub retransmitted_slices: u64,
    /// Application messages accepted by `send` (both modes).
    pub messages_sent: u64,
    /// Application messages handed to the event channel (both modes).
    pub messages_delivered: u64,
    /// Slices of already-delivered messages.
    pub stale_slices: u64,
    /// Slices at or below the ack cursor of the current message.
    pub duplicate_slices: u64,
    /// Datagrams from endpoints without connection state.
    pub unknown_peer_drops: u64,
}

impl EndpointStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of sends that were retransmissions.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.datagrams_sent == 0 {
            0.0
        } else {
            self.retransmitted_slices as f64 / self.datagrams_sent as f64
        }
    }
}
