//! Alternating-bit reliability bookkeeping for one connection.
//!
//! There are no per-message acknowledgements. Instead each side keeps one
//! parity bit per direction:
//!
//! - **peer parity** flips whenever the server sends a reliable frame with a
//!   sequence newer than the last reliable one seen. It is echoed back in the
//!   flag of every outbound `seq_b`, which tells the server its reliable data
//!   arrived.
//! - **local parity** is the server's echo of ours. When the flag on an
//!   inbound `seq_b` differs from the previous inbound one, the server has
//!   accepted our outstanding reliable frame.
//!
//! Only one reliable frame can be in flight per direction, which is what
//! makes a single bit sufficient.
//!
//! A frame whose sequence is not newer than the newest one seen is stale. It
//! changes nothing: its data is dropped, so acknowledging it would lose it.

use crate::network::sequence::SequenceNumber;

/// What an inbound sequence pair changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObserveOutcome {
    /// The frame carried new reliable data from the server.
    pub peer_parity_flipped: bool,
    /// The server acknowledged our outstanding reliable frame.
    pub local_parity_flipped: bool,
    /// The frame's sequence is not newer than one already seen.
    pub stale: bool,
}

/// Sequence and parity state for one connection.
///
/// A fresh value belongs to a fresh connection; reconnecting creates a new
/// one rather than resetting fields in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliabilityState {
    client_seq: SequenceNumber,
    peer_seq: SequenceNumber,
    last_reliable_peer_seq: u32,
    peer_parity: bool,
    local_parity: bool,
    local_parity_flips: u64,
}

impl Default for ReliabilityState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliabilityState {
    /// State for a connection that has exchanged nothing yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            client_seq: SequenceNumber::new(0, false),
            peer_seq: SequenceNumber::new(0, false),
            last_reliable_peer_seq: 0,
            peer_parity: false,
            local_parity: false,
            local_parity_flips: 0,
        }
    }

    /// Updates parity state from an inbound frame's sequence pair.
    ///
    /// A stale pair is reported as such and leaves the state untouched.
    pub fn observe(&mut self, seq_a: SequenceNumber, seq_b: SequenceNumber) -> ObserveOutcome {
        let mut outcome = ObserveOutcome::default();
        if seq_a.value() <= self.peer_seq.value() && self.peer_seq.value() != 0 {
            outcome.stale = true;
            return outcome;
        }
        self.peer_seq = seq_a;

        if seq_a.is_reliable() && seq_a.value() > self.last_reliable_peer_seq {
            self.last_reliable_peer_seq = seq_a.value();
            self.peer_parity = !self.peer_parity;
            outcome.peer_parity_flipped = true;
        }

        if seq_b.is_reliable() != self.local_parity {
            self.local_parity = seq_b.is_reliable();
            self.local_parity_flips += 1;
            outcome.local_parity_flipped = true;
        }
        outcome
    }

    /// Allocates the sequence pair for the next outbound frame.
    ///
    /// `seq_a` is our next counter flagged with `reliable`; `seq_b` echoes
    /// the newest server sequence flagged with the peer parity.
    pub fn next_outgoing(&mut self, reliable: bool) -> (SequenceNumber, SequenceNumber) {
        self.client_seq = self.client_seq.next().with_reliable(reliable);
        (
            self.client_seq,
            self.peer_seq.with_reliable(self.peer_parity),
        )
    }

    /// Our most recently sent sequence.
    #[must_use]
    pub const fn client_seq(&self) -> SequenceNumber {
        self.client_seq
    }

    /// The newest server sequence seen.
    #[must_use]
    pub const fn peer_seq(&self) -> SequenceNumber {
        self.peer_seq
    }

    /// Counter of the newest reliable server frame seen.
    #[must_use]
    pub const fn last_reliable_peer_seq(&self) -> u32 {
        self.last_reliable_peer_seq
    }

    /// Parity we echo to the server.
    #[must_use]
    pub const fn peer_parity(&self) -> bool {
        self.peer_parity
    }

    /// Parity the server last echoed to us.
    #[must_use]
    pub const fn local_parity(&self) -> bool {
        self.local_parity
    }

    /// How many times the local parity has flipped. A reliable sender waits
    /// for this to move past the value it saw when it sent.
    #[must_use]
    pub const fn local_parity_flips(&self) -> u64 {
        self.local_parity_flips
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn seq(value: u32, reliable: bool) -> SequenceNumber {
        SequenceNumber::new(value, reliable)
    }

    #[test]
    fn peer_parity_flips_once_per_new_reliable_sequence() {
        let mut state = ReliabilityState::new();
        let inbound = [
            seq(5, true),
            seq(6, false),
            seq(7, true),
            seq(7, true),
            seq(9, true),
        ];
        let mut flipped = Vec::new();
        for (index, seq_a) in inbound.into_iter().enumerate() {
            if state.observe(seq_a, seq(0, false)).peer_parity_flipped {
                flipped.push(index);
            }
        }
        assert_eq!(flipped, vec![0, 2, 4]);
        assert_eq!(state.last_reliable_peer_seq(), 9);
        assert!(state.peer_parity());
    }

    #[test]
    fn duplicate_is_flagged_stale() {
        let mut state = ReliabilityState::new();
        assert!(!state.observe(seq(3, false), seq(0, false)).stale);
        assert!(state.observe(seq(3, false), seq(0, false)).stale);
        assert!(state.observe(seq(2, false), seq(0, false)).stale);
        assert_eq!(state.peer_seq().value(), 3);
    }

    #[test]
    fn stale_frame_leaves_parity_alone() {
        let mut state = ReliabilityState::new();
        state.observe(seq(3, false), seq(0, false));
        let before = state.clone();
        // Reliable and echoing a flipped parity, but older than frame 3.
        let outcome = state.observe(seq(2, true), seq(1, true));
        assert_eq!(
            outcome,
            ObserveOutcome {
                stale: true,
                ..ObserveOutcome::default()
            }
        );
        assert_eq!(state, before);
        assert!(state.observe(seq(4, true), seq(1, false)).peer_parity_flipped);
    }

    #[test]
    fn local_parity_flips_on_echo_change() {
        let mut state = ReliabilityState::new();
        assert!(!state.observe(seq(1, false), seq(1, false)).local_parity_flipped);
        assert!(state.observe(seq(2, false), seq(2, true)).local_parity_flipped);
        assert!(!state.observe(seq(3, false), seq(3, true)).local_parity_flipped);
        assert!(state.observe(seq(4, false), seq(4, false)).local_parity_flipped);
        assert_eq!(state.local_parity_flips(), 2);
        assert!(!state.local_parity());
    }

    #[test]
    fn outgoing_sequence_increments_and_echoes_peer() {
        let mut state = ReliabilityState::new();
        let (a, b) = state.next_outgoing(false);
        assert_eq!(a.value(), 1);
        assert!(!a.is_reliable());
        assert_eq!(b.value(), 0);
        assert!(!b.is_reliable());

        state.observe(seq(12, true), seq(1, false));
        let (a, b) = state.next_outgoing(true);
        assert_eq!(a.value(), 2);
        assert!(a.is_reliable());
        assert_eq!(b.value(), 12);
        assert!(b.is_reliable());

        let (a, _) = state.next_outgoing(false);
        assert_eq!(a.value(), 3);
        assert!(!a.is_reliable());
    }
}
