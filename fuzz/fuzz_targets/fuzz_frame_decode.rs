//! Fuzz target for server datagram decoding.
//!
//! Arbitrary bytes go through frame splitting, message decoding and world
//! application, the path every datagram from the network takes.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary input
//! - Decoding the same bytes twice gives the same frame
//! - Decoded messages never extend past the datagram

#![no_main]

use libfuzzer_sys::fuzz_target;

use netchan_client::__internal::{connectionless_text, ConnectionlessReply};
use netchan_client::{GameState, MessageCatalog, ServerFrame, WireFrame, World};

fuzz_target!(|data: &[u8]| {
    // Splitting never panics and re-encodes to the same bytes when it succeeds.
    if let Ok(frame) = WireFrame::parse(data) {
        assert_eq!(frame.encode(), data);
    }

    if let Some(text) = connectionless_text(data) {
        let _reply = ConnectionlessReply::parse(&text);
        return;
    }

    let catalog = MessageCatalog::standard();
    let Ok(frame) = ServerFrame::decode(data, &catalog) else {
        return;
    };
    assert_eq!(ServerFrame::decode(data, &catalog).ok().as_ref(), Some(&frame));

    let mut world = GameState::default();
    for decoded in &frame.messages {
        assert!(decoded.offset < data.len());
        world.apply(&decoded.message);
    }
    let _spawned = world.is_spawned();
});
