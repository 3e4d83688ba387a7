//! Property-based tests for the wire format.
//!
//! Covered properties:
//! - Sequence words survive encode/decode with counter and flag intact
//! - `next` and `previous` move the counter and keep the flag
//! - Frame splitting is the inverse of frame building
//! - Server frame decoding is pure and accounts for every byte
//! - Applying any decoded datagram to a world never panics

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use netchan_client::__internal::is_connectionless_datagram;
use netchan_client::{
    GameState, MessageCatalog, SequenceNumber, ServerFrame, ServerMessage, WireFrame, World,
};
use proptest::prelude::*;

fn sequenced_datagram() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 8..512)
        .prop_filter("sequenced", |bytes| !is_connectionless_datagram(bytes))
}

/// Datagrams built from valid tags, so decoders get past the first byte.
fn tagged_datagram() -> impl Strategy<Value = Vec<u8>> {
    (
        0..SequenceNumber::MAX_VALUE,
        any::<u32>(),
        prop::collection::vec((1u8..=20, prop::collection::vec(any::<u8>(), 0..24)), 0..8),
    )
        .prop_map(|(seq_a, seq_b, messages)| {
            let mut out = seq_a.to_le_bytes().to_vec();
            out.extend_from_slice(&seq_b.to_le_bytes());
            for (tag, body) in messages {
                out.push(tag);
                out.extend_from_slice(&body);
            }
            out
        })
}

proptest! {
    #[test]
    fn prop_sequence_word_round_trips(raw in any::<u32>()) {
        let seq = SequenceNumber::from_raw(raw);
        prop_assert_eq!(seq.to_raw(), raw);
        let decoded = SequenceNumber::decode(&seq.encode(), 0);
        prop_assert_eq!(decoded.value(), raw & SequenceNumber::MAX_VALUE);
        prop_assert_eq!(decoded.is_reliable(), raw & (1 << 31) != 0);
    }

    #[test]
    fn prop_next_and_previous(value in 1..SequenceNumber::MAX_VALUE, reliable in any::<bool>()) {
        let seq = SequenceNumber::new(value, reliable);
        prop_assert_eq!(seq.next().value(), value + 1);
        prop_assert_eq!(seq.next().is_reliable(), reliable);
        prop_assert_eq!(seq.next().previous().value(), value);
        prop_assert!(seq.previous().value() >= 1);
        prop_assert_eq!(seq.previous().is_reliable(), reliable);
    }

    #[test]
    fn prop_wire_frame_parse_inverts_encode(bytes in sequenced_datagram()) {
        let frame = WireFrame::parse(&bytes).unwrap();
        prop_assert!(!frame.is_connectionless());
        prop_assert_eq!(frame.encode(), bytes);
    }

    #[test]
    fn prop_connectionless_text_round_trips(text in "[a-z0-9 \\\\]{0,64}") {
        let frame = WireFrame::connectionless(&text);
        let parsed = WireFrame::parse(&frame.encode()).unwrap();
        prop_assert!(parsed.is_connectionless());
        prop_assert_eq!(parsed.payload, text.into_bytes());
    }

    #[test]
    fn prop_decode_is_pure(bytes in sequenced_datagram()) {
        let catalog = MessageCatalog::standard();
        let first = ServerFrame::decode(&bytes, &catalog).unwrap();
        let second = ServerFrame::decode(&bytes, &catalog).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_decode_accounts_for_every_byte(bytes in tagged_datagram()) {
        let catalog = MessageCatalog::standard();
        let frame = ServerFrame::decode(&bytes, &catalog).unwrap();

        let mut expected_offset = 8;
        for (index, decoded) in frame.messages.iter().enumerate() {
            prop_assert_eq!(decoded.offset, expected_offset);
            if let ServerMessage::Bad { offset, bytes: rest, .. } = &decoded.message {
                // A bad message swallows the rest of the datagram.
                prop_assert_eq!(index, frame.messages.len() - 1);
                prop_assert_eq!(*offset, decoded.offset);
                prop_assert_eq!(rest.as_slice(), &bytes[decoded.offset..]);
                expected_offset = bytes.len();
                break;
            }
            let next = frame
                .messages
                .get(index + 1)
                .map_or(bytes.len(), |m| m.offset);
            prop_assert!(next > decoded.offset);
            expected_offset = next;
        }
        if frame.messages.is_empty() {
            prop_assert_eq!(bytes.len(), 8);
        } else {
            prop_assert_eq!(expected_offset, bytes.len());
        }
    }

    #[test]
    fn prop_world_accepts_any_datagram(datagrams in prop::collection::vec(tagged_datagram(), 1..8)) {
        let catalog = MessageCatalog::standard();
        let mut world = GameState::default();
        let mut bad = 0u64;
        for bytes in &datagrams {
            let frame = ServerFrame::decode(bytes, &catalog).unwrap();
            for decoded in &frame.messages {
                if matches!(decoded.message, ServerMessage::Bad { .. }) {
                    bad += 1;
                }
                world.apply(&decoded.message);
            }
        }
        // Level changes keep the count.
        prop_assert_eq!(world.bad_message_count(), bad);
    }
}
