//! Parity bookkeeping invariants under random inbound traffic.
//!
//! The state machine is driven by arbitrary sequence pairs, late and
//! duplicated ones included, and checked against a direct model of the two
//! alternating bits.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use netchan_client::__internal::ReliabilityState;
use netchan_client::SequenceNumber;
use proptest::prelude::*;

fn inbound_pair() -> impl Strategy<Value = (SequenceNumber, SequenceNumber)> {
    (
        (1u32..64, any::<bool>()).prop_map(|(v, r)| SequenceNumber::new(v, r)),
        (0u32..64, any::<bool>()).prop_map(|(v, r)| SequenceNumber::new(v, r)),
    )
}

proptest! {
    #[test]
    fn prop_parities_follow_the_model(pairs in prop::collection::vec(inbound_pair(), 0..64)) {
        let mut state = ReliabilityState::new();
        let mut newest = 0u32;
        let mut newest_reliable = 0u32;
        let mut peer_parity = false;
        let mut last_echo = false;
        let mut flips = 0u64;

        for (seq_a, seq_b) in pairs {
            let outcome = state.observe(seq_a, seq_b);

            let stale = newest != 0 && seq_a.value() <= newest;
            prop_assert_eq!(outcome.stale, stale);
            if stale {
                prop_assert!(!outcome.peer_parity_flipped && !outcome.local_parity_flipped);
                prop_assert_eq!(state.peer_seq().value(), newest);
                prop_assert_eq!(state.local_parity_flips(), flips);
                continue;
            }
            newest = seq_a.value();

            let new_reliable = seq_a.is_reliable() && seq_a.value() > newest_reliable;
            if new_reliable {
                newest_reliable = seq_a.value();
                peer_parity = !peer_parity;
            }
            let echo_changed = seq_b.is_reliable() != last_echo;
            if echo_changed {
                last_echo = seq_b.is_reliable();
                flips += 1;
            }

            prop_assert_eq!(outcome.peer_parity_flipped, new_reliable);
            prop_assert_eq!(outcome.local_parity_flipped, echo_changed);
            prop_assert_eq!(state.peer_parity(), peer_parity);
            prop_assert_eq!(state.last_reliable_peer_seq(), newest_reliable);
            prop_assert_eq!(state.local_parity_flips(), flips);
        }
    }

    #[test]
    fn prop_outgoing_sequence_is_strictly_increasing(
        reliable in prop::collection::vec(any::<bool>(), 1..64),
    ) {
        let mut state = ReliabilityState::new();
        let mut previous = 0;
        for flag in reliable {
            let (seq_a, _) = state.next_outgoing(flag);
            prop_assert_eq!(seq_a.value(), previous + 1);
            prop_assert_eq!(seq_a.is_reliable(), flag);
            previous = seq_a.value();
        }
    }

    #[test]
    fn prop_outgoing_echo_carries_peer_parity(pairs in prop::collection::vec(inbound_pair(), 1..32)) {
        let mut state = ReliabilityState::new();
        let mut newest = 0;
        for (seq_a, seq_b) in pairs {
            state.observe(seq_a, seq_b);
            newest = newest.max(seq_a.value());
            let (_, echo) = state.next_outgoing(false);
            prop_assert_eq!(echo.value(), newest);
            prop_assert_eq!(echo.is_reliable(), state.peer_parity());
        }
    }
}
